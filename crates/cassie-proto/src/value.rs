//! Runtime values exchanged with the server.

use std::net::IpAddr;

use num_bigint::BigInt;
use uuid::Uuid;

use crate::types::ColumnType;
use crate::Error;

/// Wire value 2^31 is 1970-01-01.
pub const DATE_EPOCH_OFFSET: i64 = 1 << 31;

/// Nanoseconds in one day; `Time` values are strictly below this.
pub const NANOS_PER_DAY: u64 = 86_400_000_000_000;

/// Largest power of ten a decimal is expanded by, when rescaling or when
/// printed in plain notation.
const MAX_DECIMAL_EXPONENT: u32 = 4096;

/// An arbitrary-precision decimal as `unscaled * 10^-scale`.
///
/// Equality compares the representation: `1.0` (`10, 1`) and `1.00`
/// (`100, 2`) are different values. Use [`Decimal::rescale`] to compare
/// numerically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Decimal {
    unscaled: BigInt,
    scale: i32,
}

impl Decimal {
    pub fn new(unscaled: impl Into<BigInt>, scale: i32) -> Self {
        Self {
            unscaled: unscaled.into(),
            scale,
        }
    }

    pub fn unscaled(&self) -> &BigInt {
        &self.unscaled
    }

    pub fn scale(&self) -> i32 {
        self.scale
    }

    /// Returns the same number at a larger scale, or `None` if that would
    /// lose digits or grow it by more than 4096 digits.
    pub fn rescale(&self, scale: i32) -> Option<Decimal> {
        let exponent = u32::try_from(i64::from(scale) - i64::from(self.scale)).ok()?;
        if exponent > MAX_DECIMAL_EXPONENT {
            return None;
        }
        let factor = BigInt::from(10u32).pow(exponent);
        Some(Decimal::new(&self.unscaled * factor, scale))
    }
}

impl std::str::FromStr for Decimal {
    type Err = Error;

    /// Parses plain decimal notation (`-12.340`); the scale is the number of
    /// fractional digits as written.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i, f),
            None => (s, ""),
        };
        if frac_part.starts_with(['+', '-']) {
            return Err(Error::encode(format!("invalid decimal '{}'", s)));
        }
        let digits = format!("{}{}", int_part, frac_part);
        let unscaled: BigInt = digits
            .parse()
            .map_err(|_| Error::encode(format!("invalid decimal '{}'", s)))?;
        let scale = i32::try_from(frac_part.len())
            .map_err(|_| Error::encode(format!("decimal scale too large in '{}'", s)))?;
        Ok(Decimal::new(unscaled, scale))
    }
}

impl std::fmt::Display for Decimal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let exponent = self.scale.unsigned_abs();
        if exponent > MAX_DECIMAL_EXPONENT {
            // Scientific notation instead of expanding billions of zeros.
            let sign = if self.scale < 0 { '+' } else { '-' };
            return write!(f, "{}E{}{}", self.unscaled, sign, exponent);
        }
        if self.scale <= 0 {
            let factor = BigInt::from(10u32).pow(exponent);
            return write!(f, "{}", &self.unscaled * factor);
        }
        let negative = self.unscaled.sign() == num_bigint::Sign::Minus;
        let digits = self.unscaled.magnitude().to_string();
        let scale = self.scale as usize;
        let padded = if digits.len() <= scale {
            format!("{}{}", "0".repeat(scale - digits.len() + 1), digits)
        } else {
            digits
        };
        let (int_part, frac_part) = padded.split_at(padded.len() - scale);
        write!(
            f,
            "{}{}.{}",
            if negative { "-" } else { "" },
            int_part,
            frac_part
        )
    }
}

/// A calendar date as the unsigned day count used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Date(u32);

impl Date {
    /// From the raw wire representation.
    pub fn from_raw(raw: u32) -> Self {
        Date(raw)
    }

    /// From a signed day offset relative to 1970-01-01.
    pub fn from_unix_days(days: i64) -> Result<Self, Error> {
        days.checked_add(DATE_EPOCH_OFFSET)
            .and_then(|raw| u32::try_from(raw).ok())
            .map(Date)
            .ok_or_else(|| Error::encode(format!("date {} days from epoch out of range", days)))
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// Signed day offset relative to 1970-01-01.
    pub fn unix_days(self) -> i64 {
        i64::from(self.0) - DATE_EPOCH_OFFSET
    }
}

/// Time of day in nanoseconds since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Time(u64);

impl Time {
    pub fn from_nanos(nanos: u64) -> Result<Self, Error> {
        if nanos >= NANOS_PER_DAY {
            return Err(Error::encode(format!(
                "time {}ns is not within a day",
                nanos
            )));
        }
        Ok(Time(nanos))
    }

    pub fn from_hms_nano(hour: u32, minute: u32, second: u32, nano: u32) -> Result<Self, Error> {
        if minute >= 60 || second >= 60 || nano >= 1_000_000_000 {
            return Err(Error::encode(format!(
                "invalid time {:02}:{:02}:{:02}.{:09}",
                hour, minute, second, nano
            )));
        }
        let secs = u64::from(hour) * 3600 + u64::from(minute) * 60 + u64::from(second);
        Self::from_nanos(secs * 1_000_000_000 + u64::from(nano))
    }

    pub fn nanos(self) -> u64 {
        self.0
    }
}

/// A value of one of the supported column types.
///
/// Every variant except `Null` resolves to exactly one [`ColumnType`] through
/// [`Value::natural_type`]; encoding always happens against a declared type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Counter(i64),
    Float(f32),
    Double(f64),
    Varint(BigInt),
    Decimal(Decimal),
    Ascii(String),
    Text(String),
    Blob(Vec<u8>),
    Uuid(Uuid),
    Timeuuid(Uuid),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    Date(Date),
    Time(Time),
    Inet(IpAddr),
    List(Vec<Value>),
    Set(Vec<Value>),
    /// Map entries in wire order.
    Map(Vec<(Value, Value)>),
    Tuple(Vec<Value>),
    /// UDT fields in declaration order.
    Udt(Vec<(String, Value)>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The column type this value maps to when no declared type is known
    /// (simple statements). Collections take their element type from the
    /// first non-null element; empty collections report `blob` elements,
    /// which encode identically.
    pub fn natural_type(&self) -> Option<ColumnType> {
        Some(match self {
            Value::Null => return None,
            Value::Boolean(_) => ColumnType::Boolean,
            Value::TinyInt(_) => ColumnType::TinyInt,
            Value::SmallInt(_) => ColumnType::SmallInt,
            Value::Int(_) => ColumnType::Int,
            Value::BigInt(_) => ColumnType::BigInt,
            Value::Counter(_) => ColumnType::Counter,
            Value::Float(_) => ColumnType::Float,
            Value::Double(_) => ColumnType::Double,
            Value::Varint(_) => ColumnType::Varint,
            Value::Decimal(_) => ColumnType::Decimal,
            Value::Ascii(_) => ColumnType::Ascii,
            Value::Text(_) => ColumnType::Text,
            Value::Blob(_) => ColumnType::Blob,
            Value::Uuid(_) => ColumnType::Uuid,
            Value::Timeuuid(_) => ColumnType::Timeuuid,
            Value::Timestamp(_) => ColumnType::Timestamp,
            Value::Date(_) => ColumnType::Date,
            Value::Time(_) => ColumnType::Time,
            Value::Inet(_) => ColumnType::Inet,
            Value::List(items) => ColumnType::list(element_type(items.iter())),
            Value::Set(items) => ColumnType::set(element_type(items.iter())),
            Value::Map(entries) => ColumnType::map(
                element_type(entries.iter().map(|(k, _)| k)),
                element_type(entries.iter().map(|(_, v)| v)),
            ),
            Value::Tuple(items) => ColumnType::Tuple(
                items
                    .iter()
                    .map(|v| v.natural_type().unwrap_or(ColumnType::Blob))
                    .collect(),
            ),
            Value::Udt(_) => return None,
        })
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(i) => Some(*i),
            Value::SmallInt(i) => Some(i32::from(*i)),
            Value::TinyInt(i) => Some(i32::from(*i)),
            _ => None,
        }
    }

    /// Widening accessor for every fixed-width integer type.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::BigInt(i) | Value::Counter(i) | Value::Timestamp(i) => Some(*i),
            other => other.as_i32().map(i64::from),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(f) => Some(*f),
            Value::Float(f) => Some(f64::from(*f)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Ascii(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<&Uuid> {
        match self {
            Value::Uuid(u) | Value::Timeuuid(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_varint(&self) -> Option<&BigInt> {
        match self {
            Value::Varint(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<&Decimal> {
        match self {
            Value::Decimal(d) => Some(d),
            _ => None,
        }
    }
}

fn element_type<'a>(mut items: impl Iterator<Item = &'a Value>) -> ColumnType {
    items
        .find_map(Value::natural_type)
        .unwrap_or(ColumnType::Blob)
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn join<T>(
            f: &mut std::fmt::Formatter<'_>,
            open: &str,
            close: &str,
            items: &[T],
            mut each: impl FnMut(&mut std::fmt::Formatter<'_>, &T) -> std::fmt::Result,
        ) -> std::fmt::Result {
            f.write_str(open)?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                each(f, item)?;
            }
            f.write_str(close)
        }

        match self {
            Value::Null => f.write_str("null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::TinyInt(i) => write!(f, "{}", i),
            Value::SmallInt(i) => write!(f, "{}", i),
            Value::Int(i) => write!(f, "{}", i),
            Value::BigInt(i) | Value::Counter(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Varint(v) => write!(f, "{}", v),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Ascii(s) | Value::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Value::Blob(b) => {
                f.write_str("0x")?;
                b.iter().try_for_each(|byte| write!(f, "{:02x}", byte))
            }
            Value::Uuid(u) | Value::Timeuuid(u) => write!(f, "{}", u),
            Value::Timestamp(ms) => write!(f, "{}", ms),
            Value::Date(d) => write!(f, "{}", d.unix_days()),
            Value::Time(t) => write!(f, "{}", t.nanos()),
            Value::Inet(ip) => write!(f, "'{}'", ip),
            Value::List(items) => join(f, "[", "]", items, |f, v| write!(f, "{}", v)),
            Value::Set(items) => join(f, "{", "}", items, |f, v| write!(f, "{}", v)),
            Value::Map(entries) => {
                join(f, "{", "}", entries, |f, (k, v)| write!(f, "{}: {}", k, v))
            }
            Value::Tuple(items) => join(f, "(", ")", items, |f, v| write!(f, "{}", v)),
            Value::Udt(fields) => {
                join(f, "{", "}", fields, |f, (k, v)| write!(f, "{}: {}", k, v))
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::TinyInt(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::SmallInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<BigInt> for Value {
    fn from(v: BigInt) -> Self {
        Value::Varint(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<Date> for Value {
    fn from(v: Date) -> Self {
        Value::Date(v)
    }
}

impl From<Time> for Value {
    fn from(v: Time) -> Self {
        Value::Time(v)
    }
}

impl From<IpAddr> for Value {
    fn from(v: IpAddr) -> Self {
        Value::Inet(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}
