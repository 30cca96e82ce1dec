//! Shared record types: timestamps, identifiers and book classifications
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = String;
pub type BookId = String;
pub type TradeId = String;
pub type LockId = String;
pub type ChatId = String;

/// A UTC instant, stored as nanoseconds since the epoch.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// `None` when the result leaves the range a stored timestamp can hold.
    pub fn checked_plus_hours(&self, hours: u32) -> Option<Self> {
        let later = self.0.checked_add_signed(Duration::try_hours(i64::from(hours))?)?;
        later.timestamp_nanos_opt().map(|_| Self(later))
    }
    pub fn nanos(&self) -> i64 {
        self.0.timestamp_nanos_opt().unwrap_or(i64::MAX)
    }
}

impl Default for TimeStamp {
    fn default() -> Self {
        Self::new()
    }
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Which list a book record sits on.
#[derive(
    minicbor::Encode,
    minicbor::Decode,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ListType {
    #[n(0)]
    Inventory,
    #[n(1)]
    Wishlist,
}

#[derive(
    minicbor::Encode,
    minicbor::Decode,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    #[n(0)]
    New,
    #[n(1)]
    LikeNew,
    #[default]
    #[n(2)]
    Good,
    #[n(3)]
    Fair,
    #[n(4)]
    Poor,
}
