use std::time::{Duration, Instant};

use maud::{Markup, PreEscaped, html};
use time::{OffsetDateTime, macros::format_description};

pub fn timeago(value: OffsetDateTime) -> String {
    let Ok(duration) = Duration::try_from(OffsetDateTime::now_utc() - value) else {
        return "[out of range]".to_string();
    };
    timeago::Formatter::new().convert(duration)
}

pub fn date(value: OffsetDateTime) -> String {
    value.format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second] [offset_hour sign:mandatory]:[offset_minute]"
    )).unwrap_or_else(|_| "[invalid]".to_string())
}

const STYLE: &str = r#"
body{font-family:system-ui,sans-serif;max-width:960px;margin:0 auto;padding:1rem}
table{width:100%;border-collapse:collapse}
th,td{text-align:left;padding:.4rem;border-bottom:1px solid #8884}
.muted{opacity:.7}
"#;

pub fn header() -> Markup {
    html! {
        meta name="viewport" content="width=device-width, initial-scale=1.0";
        meta name="color-scheme" content="dark light";
        style { (PreEscaped(STYLE)) }
    }
}

pub fn nav() -> Markup {
    html! {
        header {
            nav {
                a href="/" { strong { "terrapin" } }
            }
        }
    }
}

pub fn footer(start: Instant) -> Markup {
    let elapsed = start.elapsed();
    html! {
        footer {
            small class="muted" { "Generated in " (elapsed.as_millis()) "ms" }
        }
    }
}
