//! Utility functions shared by the fetcher, reconciler and CLI.
//!
//! - **Time**: parsing wire timestamps, display formatting, hour truncation
//! - **Text**: label sanitization for folder names and provider labels
//!
//! # Examples
//!
//! ```
//! use wxsync::util::{format_display_time, parse_timestamp};
//!
//! let t = parse_timestamp("2025-06-01T12:00:00+00:00").unwrap();
//! assert_eq!(format_display_time(&t), "01/06/2025 12:00");
//! ```

mod text;
mod time;

pub use text::{sanitize_label, title_case};
pub use time::{
    format_display_time, format_wire_time, nearest_time, parse_timestamp, truncate_to_hour,
    Timestamp,
};
