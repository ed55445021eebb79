//! Date and time types.
//!
//! Binary forms count from the PostgreSQL epoch 2000-01-01, in days for
//! `date` and microseconds for the timestamp family. `interval` keeps
//! months, days and microseconds separate because their lengths are not
//! commensurable.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use time::{
    Date, Duration, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset,
    macros::{date, datetime, format_description},
};

use super::{Codec, CodecRegistry, DecodeError, EncodeError, Encoded, PgValue, primitive::{check_len, text_str}};
use crate::postgres::{Oid, PgFormat, oid};

const PG_EPOCH_DATE: Date = date!(2000 - 01 - 01);
const PG_EPOCH_DATETIME: PrimitiveDateTime = datetime!(2000-01-01 0:00);
const PG_EPOCH_UTC: OffsetDateTime = datetime!(2000-01-01 0:00 UTC);

/// A postgres `interval`: months, days and microseconds, kept separate
/// the way the server stores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interval {
    pub months: i32,
    pub days: i32,
    pub microseconds: i64,
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} mons {} days {} us", self.months, self.days, self.microseconds)
    }
}

#[derive(Debug)]
pub struct TemporalCodec;

impl Codec for TemporalCodec {
    fn can_decode(&self, oid: Oid, _: PgFormat) -> bool {
        matches!(
            oid,
            oid::DATE | oid::TIME | oid::TIMESTAMP | oid::TIMESTAMPTZ | oid::INTERVAL,
        )
    }

    fn decode(
        &self,
        _: &CodecRegistry,
        raw: &Bytes,
        oid: Oid,
        format: PgFormat,
    ) -> Result<PgValue, DecodeError> {
        match format {
            PgFormat::Binary => decode_binary(raw, oid),
            PgFormat::Text => decode_text(text_str(raw)?, oid),
        }
    }

    fn can_encode(&self, value: &PgValue) -> bool {
        matches!(
            value,
            PgValue::Date(_)
                | PgValue::Time(_)
                | PgValue::Timestamp(_)
                | PgValue::TimestampTz(_)
                | PgValue::Interval(_),
        )
    }

    fn encode(&self, _: &CodecRegistry, value: &PgValue) -> Result<Encoded, EncodeError> {
        Ok(match value {
            PgValue::Date(d) => {
                let days = (*d - PG_EPOCH_DATE).whole_days();
                Encoded::inline(&(days as i32).to_be_bytes(), oid::DATE)
            },
            PgValue::Time(t) => {
                let micros = (*t - Time::MIDNIGHT).whole_microseconds() as i64;
                Encoded::inline(&micros.to_be_bytes(), oid::TIME)
            },
            PgValue::Timestamp(ts) => {
                let micros = micros_i64(*ts - PG_EPOCH_DATETIME)?;
                Encoded::inline(&micros.to_be_bytes(), oid::TIMESTAMP)
            },
            PgValue::TimestampTz(ts) => {
                let micros = micros_i64(*ts - PG_EPOCH_UTC)?;
                Encoded::inline(&micros.to_be_bytes(), oid::TIMESTAMPTZ)
            },
            PgValue::Interval(iv) => {
                let mut buf = BytesMut::with_capacity(16);
                buf.put_i64(iv.microseconds);
                buf.put_i32(iv.days);
                buf.put_i32(iv.months);
                Encoded::binary(buf.freeze(), oid::INTERVAL)
            },
            _ => return Err(EncodeError::Unsupported(value.type_name())),
        })
    }

    fn preferred_type(&self, oid: Oid, _: PgFormat) -> Option<&'static str> {
        match oid {
            oid::DATE => Some("time::Date"),
            oid::TIME => Some("time::Time"),
            oid::TIMESTAMP => Some("time::PrimitiveDateTime"),
            oid::TIMESTAMPTZ => Some("time::OffsetDateTime"),
            oid::INTERVAL => Some("Interval"),
            _ => None,
        }
    }
}

fn micros_i64(duration: Duration) -> Result<i64, EncodeError> {
    duration
        .whole_microseconds()
        .try_into()
        .map_err(|_| EncodeError::OutOfRange("timestamp"))
}

fn out_of_range(what: &'static str) -> DecodeError {
    DecodeError::malformed(format!("{what} out of range"))
}

fn decode_binary(raw: &Bytes, oid: Oid) -> Result<PgValue, DecodeError> {
    let mut buf = &raw[..];
    match oid {
        oid::DATE => {
            check_len(raw, 4, "date")?;
            let days = buf.get_i32();
            PG_EPOCH_DATE
                .checked_add(Duration::days(days as i64))
                .map(PgValue::Date)
                .ok_or_else(|| out_of_range("date"))
        },
        oid::TIME => {
            check_len(raw, 8, "time")?;
            let micros = buf.get_i64();
            if !(0..86_400_000_000).contains(&micros) {
                return Err(out_of_range("time"));
            }
            Ok(PgValue::Time(Time::MIDNIGHT + Duration::microseconds(micros)))
        },
        oid::TIMESTAMP => {
            check_len(raw, 8, "timestamp")?;
            let micros = buf.get_i64();
            PG_EPOCH_DATETIME
                .checked_add(Duration::microseconds(micros))
                .map(PgValue::Timestamp)
                .ok_or_else(|| out_of_range("timestamp"))
        },
        oid::TIMESTAMPTZ => {
            check_len(raw, 8, "timestamptz")?;
            let micros = buf.get_i64();
            PG_EPOCH_UTC
                .checked_add(Duration::microseconds(micros))
                .map(PgValue::TimestampTz)
                .ok_or_else(|| out_of_range("timestamptz"))
        },
        _ => {
            check_len(raw, 16, "interval")?;
            Ok(PgValue::Interval(Interval {
                microseconds: buf.get_i64(),
                days: buf.get_i32(),
                months: buf.get_i32(),
            }))
        },
    }
}

fn decode_text(text: &str, oid: Oid) -> Result<PgValue, DecodeError> {
    match oid {
        oid::DATE => {
            let format = format_description!("[year]-[month]-[day]");
            Date::parse(text, &format)
                .map(PgValue::Date)
                .map_err(|_| DecodeError::malformed(format!("invalid date {text:?}")))
        },
        oid::TIME => parse_time(text).map(PgValue::Time),
        oid::TIMESTAMP => parse_timestamp(text).map(PgValue::Timestamp),
        oid::TIMESTAMPTZ => {
            let (naive, offset) = split_offset(text)?;
            let ts = parse_timestamp(naive)?;
            Ok(PgValue::TimestampTz(ts.assume_offset(offset)))
        },
        _ => parse_interval(text).map(PgValue::Interval),
    }
}

fn parse_time(text: &str) -> Result<Time, DecodeError> {
    let format = format_description!("[hour]:[minute]:[second][optional [.[subsecond]]]");
    Time::parse(text, &format)
        .map_err(|_| DecodeError::malformed(format!("invalid time {text:?}")))
}

fn parse_timestamp(text: &str) -> Result<PrimitiveDateTime, DecodeError> {
    let format = format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]]"
    );
    PrimitiveDateTime::parse(text, &format)
        .map_err(|_| DecodeError::malformed(format!("invalid timestamp {text:?}")))
}

/// Split `2004-10-19 10:23:54+02[:30]` into the naive part and its
/// offset. The server always emits an explicit offset.
fn split_offset(text: &str) -> Result<(&str, UtcOffset), DecodeError> {
    let invalid = || DecodeError::malformed(format!("invalid timestamptz {text:?}"));

    // skip the date part so its dashes do not match
    let tail_at = text.find(' ').ok_or_else(invalid)? + 1;
    let sign_at = text[tail_at..]
        .rfind(['+', '-'])
        .map(|i| tail_at + i)
        .ok_or_else(invalid)?;

    let (naive, offset) = text.split_at(sign_at);
    let negative = offset.starts_with('-');
    let mut parts = offset[1..].splitn(3, ':');
    let mut next = || -> Result<i8, DecodeError> {
        match parts.next() {
            None => Ok(0),
            Some(p) => p.parse().map_err(|_| invalid()),
        }
    };
    let (mut h, mut m, mut s) = (next()?, next()?, next()?);
    if negative {
        (h, m, s) = (-h, -m, -s);
    }

    let offset = UtcOffset::from_hms(h, m, s).map_err(|_| invalid())?;
    Ok((naive, offset))
}

/// Parse the server's default interval output style, e.g.
/// `1 year 2 mons 3 days 04:05:06.789`.
fn parse_interval(text: &str) -> Result<Interval, DecodeError> {
    let invalid = || DecodeError::malformed(format!("invalid interval {text:?}"));

    let mut interval = Interval::default();
    let mut words = text.split_whitespace().peekable();

    while let Some(word) = words.next() {
        if word.contains(':') {
            // trailing time-of-day part
            let (negative, clock) = match word.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, word),
            };
            let time = parse_time(clock)?;
            let mut micros = (time - Time::MIDNIGHT).whole_microseconds() as i64;
            if negative {
                micros = -micros;
            }
            interval.microseconds += micros;
            continue;
        }

        let amount: i64 = word.parse().map_err(|_| invalid())?;
        let unit = words.next().ok_or_else(invalid)?;
        match unit.trim_end_matches('s') {
            "year" => interval.months += amount as i32 * 12,
            "mon" | "month" => interval.months += amount as i32,
            "day" => interval.days += amount as i32,
            _ => return Err(invalid()),
        }
    }

    Ok(interval)
}
