//! `MAX_UPTIME` duration grammar and the one-shot uptime timer.
//!
//! The grammar is `Nd? Nh? Nm? Ns? Nms?` in spirit: any sequence of
//! `<digits><unit>` terms (e.g. `"1h30m"`, `"4h"`, `"90s"`, `"250ms"`),
//! or bare digits, interpreted as milliseconds. Anything else is
//! rejected.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::shutdown::graceful_shutdown;
use super::state::AppState;

/// Parse a duration string into milliseconds.
pub fn parse_duration(input: &str) -> Option<u64> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if input.chars().all(|c| c.is_ascii_digit()) {
        return input.parse().ok();
    }

    let mut total: u64 = 0;
    let mut chars = input.chars().peekable();
    while chars.peek().is_some() {
        let mut digits = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_digit() {
                digits.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        if digits.is_empty() {
            return None;
        }
        let value: u64 = digits.parse().ok()?;

        let mut unit = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_alphabetic() {
                unit.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        let multiplier: u64 = match unit.as_str() {
            "d" => 86_400_000,
            "h" => 3_600_000,
            "m" => 60_000,
            "s" => 1_000,
            "ms" => 1,
            _ => return None,
        };
        total = total.checked_add(value.checked_mul(multiplier)?)?;
    }

    Some(total)
}

/// Arm the one-shot max-uptime timer, if configured.
pub fn spawn_uptime_timer(state: Arc<AppState>) {
    let Some(max_ms) = state.max_uptime_ms else {
        return;
    };
    info!("Max uptime set to {} ms", max_ms);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(max_ms)).await;
        graceful_shutdown(state, "max uptime reached").await;
    });
}
