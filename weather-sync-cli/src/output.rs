//! Plain-text rendering of service results.

use weather_sync_core::{Alert, CurrentSnapshot, ForecastEntry, Job, JobSummary};

pub fn print_current(s: &CurrentSnapshot) {
    println!("{} ({:.4}, {:.4})", s.location, s.latitude, s.longitude);
    println!("  {:<14}{}", "Conditions:", s.condition);
    println!("  {:<14}{:.1} °C", "Temperature:", s.temperature);
    println!("  {:<14}{}%", "Humidity:", s.humidity);
    println!("  {:<14}{}", "Wind:", wind(s.wind_speed, s.wind_direction));
    println!("  {:<14}{:.1} mm", "Precipitation:", s.precipitation);
    println!("  {:<14}{} hPa", "Pressure:", s.pressure);
    println!(
        "  {:<14}{} (fetched {})",
        "Observed:",
        s.observed_at.format("%Y-%m-%d %H:%M UTC"),
        s.fetched_at.format("%H:%M UTC")
    );
}

pub fn print_forecast(location: &str, entries: &[ForecastEntry]) {
    println!("Forecast for {location}");
    for e in entries {
        println!(
            "  {}  {:>5.1} .. {:>5.1} °C  rain {:>3}%  {}",
            e.forecast_date.format("%a %Y-%m-%d"),
            e.min_temp,
            e.max_temp,
            e.precipitation_probability,
            e.condition
        );
    }
}

pub fn print_alerts(alerts: &[Alert], empty: &str) {
    if alerts.is_empty() {
        println!("{empty}");
        return;
    }
    for a in alerts {
        let state = if a.is_active { "active" } else { "ended" };
        println!(
            "[{}] {} in {} ({state})\n  {} .. {}\n  {}",
            a.severity,
            a.alert_type,
            a.location,
            a.start_time.format("%Y-%m-%d %H:%M"),
            a.end_time.format("%Y-%m-%d %H:%M UTC"),
            a.description
        );
    }
}

pub fn print_history(location: &str, snapshots: &[CurrentSnapshot]) {
    if snapshots.is_empty() {
        println!("No snapshots stored for {location} in that window.");
        return;
    }
    for s in snapshots {
        println!(
            "{}  {:>5.1} °C  {:>3}%  {}",
            s.observed_at.format("%Y-%m-%d %H:%M"),
            s.temperature,
            s.humidity,
            s.condition
        );
    }
}

pub fn print_summary(job: Job, summary: &JobSummary) {
    println!(
        "{}: {} of {} locations refreshed",
        job.as_str(),
        summary.succeeded,
        summary.attempted
    );
    if summary.swept > 0 {
        println!("  {} expired alerts deactivated", summary.swept);
    }
    for location in &summary.skipped {
        println!("  skipped {location}: no coordinates known");
    }
    for failure in &summary.failed {
        println!("  failed {}: {}", failure.location, failure.error);
    }
}

fn wind(speed: f64, direction: Option<u16>) -> String {
    match direction {
        Some(deg) => format!("{speed:.1} m/s from {}", compass(deg)),
        None => format!("{speed:.1} m/s"),
    }
}

fn compass(deg: u16) -> &'static str {
    const POINTS: [&str; 8] = ["N", "NE", "E", "SE", "S", "SW", "W", "NW"];
    POINTS[((f64::from(deg % 360) + 22.5) / 45.0) as usize % 8]
}
