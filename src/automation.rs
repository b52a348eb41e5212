use crate::control::ControlPlane;
use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::sync::Arc;
use tokio::time::Duration;

pub const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Validate the narrow cron dialect: exactly five whitespace-separated
/// fields, each either `*` or a single non-negative integer literal. Ranges,
/// steps, lists, and names are rejected.
pub fn validate_cron(expr: &str) -> AppResult<()> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(AppError::Input(format!(
            "Cron expression must have exactly 5 fields, got {}",
            fields.len()
        )));
    }
    for field in fields {
        if field == "*" {
            continue;
        }
        if field.parse::<u32>().is_err() {
            return Err(AppError::Input(format!(
                "Cron field '{}' must be '*' or an integer literal",
                field
            )));
        }
    }
    Ok(())
}

/// Field order: minute, hour, day-of-month, month, day-of-week (0 = Sunday).
pub fn cron_matches(expr: &str, now: &DateTime<Utc>) -> bool {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    let actual = [
        now.minute(),
        now.hour(),
        now.day(),
        now.month(),
        now.weekday().num_days_from_sunday(),
    ];
    fields.iter().zip(actual).all(|(field, value)| {
        *field == "*" || field.parse::<u32>() == Ok(value)
    })
}

/// Two instants in the same bucket never fire the same automation twice.
pub fn minute_bucket(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M").to_string()
}

/// Spawn the recurring tick. The task holds only a weak reference and ends
/// when the plane is dropped.
pub fn start(plane: &Arc<ControlPlane>) {
    let weak = Arc::downgrade(plane);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let Some(plane) = weak.upgrade() else {
                break;
            };
            if let Err(error) = plane.automation_tick(Utc::now()) {
                tracing::warn!(error = %error, "automation tick failed");
            }
        }
    });
}
