pub mod text;

pub use text::{digits_only, norm_for_match, safe_preview, tool_slug, truncate_safe};
