//! Shared value types: timestamps, blood groups and urgency tiers
use super::error::ValidationError;
use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    /// `None` when the fields do not name a real UTC instant
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    pub fn plus_days(&self, days: i64) -> Self {
        Self(self.0 + Duration::days(days))
    }
    pub fn plus_minutes(&self, minutes: i64) -> Self {
        Self(self.0 + Duration::minutes(minutes))
    }
    /// ISO-8601 rendering used for persisted/exported shapes
    pub fn to_iso8601(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
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

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso8601())
    }
}

impl FromStr for TimeStamp {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| TimeStamp(dt.with_timezone(&Utc)))
            .map_err(|e| ValidationError::Timestamp(format!("{s}: {e}")))
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

/// The eight canonical ABO/Rh groups
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BloodType {
    #[n(0)]
    APos,
    #[n(1)]
    ANeg,
    #[n(2)]
    BPos,
    #[n(3)]
    BNeg,
    #[n(4)]
    OPos,
    #[n(5)]
    ONeg,
    #[n(6)]
    ABPos,
    #[n(7)]
    ABNeg,
}

impl BloodType {
    pub const ALL: [BloodType; 8] = [
        BloodType::APos,
        BloodType::ANeg,
        BloodType::BPos,
        BloodType::BNeg,
        BloodType::OPos,
        BloodType::ONeg,
        BloodType::ABPos,
        BloodType::ABNeg,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BloodType::APos => "A+",
            BloodType::ANeg => "A-",
            BloodType::BPos => "B+",
            BloodType::BNeg => "B-",
            BloodType::OPos => "O+",
            BloodType::ONeg => "O-",
            BloodType::ABPos => "AB+",
            BloodType::ABNeg => "AB-",
        }
    }
    pub fn is_rh_negative(&self) -> bool {
        matches!(
            self,
            BloodType::ANeg | BloodType::BNeg | BloodType::ONeg | BloodType::ABNeg
        )
    }
}

impl fmt::Display for BloodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BloodType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        BloodType::ALL
            .into_iter()
            .find(|bt| bt.as_str() == wanted)
            .ok_or_else(|| ValidationError::BloodType(s.to_string()))
    }
}

/// Ordered so that `Critical > High > Routine`
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Urgency {
    #[n(0)]
    Routine,
    #[n(1)]
    High,
    #[n(2)]
    Critical,
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Urgency::Routine => "routine",
            Urgency::High => "high",
            Urgency::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for Urgency {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "routine" => Ok(Urgency::Routine),
            "high" => Ok(Urgency::High),
            "critical" => Ok(Urgency::Critical),
            other => Err(ValidationError::Urgency(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::new();

        let encoding = minicbor::to_vec(original).unwrap();
        let decode: TimeStamp = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn timestamp_iso8601() {
        let ts = TimeStamp::new_with(2024, 6, 15, 10, 30, 0).unwrap();
        assert_eq!(ts.to_iso8601(), "2024-06-15T10:30:00.000Z");
        assert_eq!(ts.to_iso8601().parse::<TimeStamp>().unwrap(), ts);
    }

    #[test]
    fn impossible_dates_are_rejected() {
        assert!(TimeStamp::new_with(2025, 2, 30, 0, 0, 0).is_none());
        assert!(TimeStamp::new_with(2025, 13, 1, 0, 0, 0).is_none());
        assert!(TimeStamp::new_with(2024, 2, 29, 23, 59, 59).is_some());
    }

    #[test]
    fn blood_type_parses_canonical_labels() {
        for bt in BloodType::ALL {
            assert_eq!(bt.as_str().parse::<BloodType>().unwrap(), bt);
        }
        assert_eq!("ab-".parse::<BloodType>().unwrap(), BloodType::ABNeg);
        assert!("C+".parse::<BloodType>().is_err());
    }

    #[test]
    fn urgency_ordering() {
        assert!(Urgency::Critical > Urgency::High);
        assert!(Urgency::High > Urgency::Routine);
    }
}
