use nom::{
    IResult, Parser,
    character::complete::{char, space0},
    number::complete,
    sequence::{delimited, separated_pair},
};
use rand::Rng;
use std::time::Duration;

/// The whole string has to be a number, "4.5 stars" is not one
pub fn parse_float(s: &str) -> Option<f64> {
    match complete::double::<_, ()>(s.trim()) {
        Ok((rest, v)) if rest.is_empty() && v.is_finite() => Some(v),
        _ => None,
    }
}

/// The pair if both are inside the valid coordinate ranges
pub fn valid_lat_lng(lat: f64, lng: f64) -> Option<(f64, f64)> {
    ((-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng)).then_some((lat, lng))
}

fn lat_lng(s: &str) -> IResult<&str, (f64, f64), ()> {
    separated_pair(
        complete::double,
        delimited(space0, char(','), space0),
        complete::double,
    )
    .parse(s)
}

/// Parse a "lat,lng" pair as found in the spreadsheet's gps column.
/// Out of range values are rejected.
pub fn parse_lat_lng(s: &str) -> Option<(f64, f64)> {
    match lat_lng(s.trim()) {
        Ok((rest, (lat, lng))) if rest.trim().is_empty() => valid_lat_lng(lat, lng),
        _ => None,
    }
}

pub fn reduce_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Trim, and map empty strings to None
pub fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(reduce_whitespace).filter(|v| !v.is_empty())
}

pub async fn wait_with_jitter(base: Duration, jitter: Duration) {
    let extra = if jitter.is_zero() {
        Duration::ZERO
    } else {
        let ms = jitter.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(0..=ms))
    };
    let total = base + extra;
    if !total.is_zero() {
        tokio::time::sleep(total).await;
    }
}
