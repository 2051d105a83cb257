//! Wire representation of message timestamps.
//!
//! Dates travel as `YYYY-MM-DD HH:MM:SS.ffffff` strings. Parsing also accepts
//! the ISO-8601 `T` separator so that a value produced by another serializer
//! is not rejected.

use chrono::{Local, NaiveDateTime, SubsecRound};
use serde::{Deserialize, Deserializer, Serializer};

use crate::utils::error::MessageError;

pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

const PARSE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Current local time, truncated to the precision the wire format keeps.
pub fn now() -> NaiveDateTime {
    Local::now().naive_local().trunc_subsecs(6)
}

pub fn format(date: &NaiveDateTime) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse(raw: &str) -> Result<NaiveDateTime, MessageError> {
    PARSE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .ok_or_else(|| MessageError::Date(raw.to_string()))
}

pub fn serialize<S: Serializer>(date: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format(date))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse(&raw).map_err(serde::de::Error::custom)
}
