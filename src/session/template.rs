//! Output filename templates
//!
//! | code | value |
//! |---|---|
//! | `%Y` `%y` | year |
//! | `%M` | month |
//! | `%D` | day |
//! | `%h` | hour |
//! | `%m` | minute |
//! | `%s` | second |
//! | `%v` | video counter |
//! | `%i` `%l` | image counter |
//! | `%%` | literal `%` |
//!
//! Unknown codes are copied through unchanged.

use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDateTime, Timelike};
use tracing::warn;

/// Render a filename template for the given time and counters
pub fn render(template: &str, now: NaiveDateTime, image_count: u32, video_count: u32) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        let Some(code) = chars.next() else {
            // Trailing lone '%'
            out.push('%');
            break;
        };

        match code {
            'Y' | 'y' => out.push_str(&format!("{:04}", now.year())),
            'M' => out.push_str(&format!("{:02}", now.month())),
            'D' => out.push_str(&format!("{:02}", now.day())),
            'h' => out.push_str(&format!("{:02}", now.hour())),
            'm' => out.push_str(&format!("{:02}", now.minute())),
            's' => out.push_str(&format!("{:02}", now.second())),
            '%' => out.push('%'),
            'v' => out.push_str(&video_count.to_string()),
            'i' | 'l' => out.push_str(&image_count.to_string()),
            other => {
                warn!("Unknown escape %{} in filename template {:?}", other, template);
                out.push('%');
                out.push(other);
            }
        }
    }

    out
}

/// Render a template into a path, prefixing relative results with the media root
pub fn render_path(
    template: &str,
    media_root: Option<&Path>,
    now: NaiveDateTime,
    image_count: u32,
    video_count: u32,
) -> PathBuf {
    let rendered = PathBuf::from(render(template, now, image_count, video_count));
    match media_root {
        Some(root) if rendered.is_relative() => root.join(rendered),
        _ => rendered,
    }
}
