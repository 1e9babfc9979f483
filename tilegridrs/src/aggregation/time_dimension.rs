//! Classification of time-grouping dimensions into SQL expressions.
//!
//! A time dimension request names a time expression and a grouping unit;
//! units fall into three disjoint families:
//!
//! - *cyclic* units (`dayOfWeek`, `hourOfDay`, ...) yield a bounded
//!   periodic field;
//! - *serial* units (`second` ... `millennium`) yield an integer bucket
//!   number counted from an epoch anchor;
//! - *iso* formatting yields a canonical period label (`YYYY-MM`,
//!   `IYYY-"W"IW`, ...).
//!
//! Serial buckets preserve a deliberate asymmetry: 1-indexed units (day,
//! week, month, quarter, semester, trimester, year, century, millennium)
//! use `CEIL` when grouping multiple units, zero-based units (second,
//! minute, hour, decade) use `FLOOR`. This determines bucket boundary
//! alignment and must not be normalized away.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{Result, TilegridError};

const ACCEPTED_PARAMETERS: &[&str] = &["time", "units", "timezone", "count", "starting", "format"];
const REQUIRED_PARAMETERS: &[&str] = &["time", "units"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFamily {
    Cyclic,
    Serial,
    Iso,
}

impl TimeFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFamily::Cyclic => "cyclic",
            TimeFamily::Serial => "serial",
            TimeFamily::Iso => "iso",
        }
    }
}

/// Result of classifying a time dimension: the SQL expression to group by
/// and the canonicalized parameters that produced it.
#[derive(Debug, Clone)]
pub struct TimeDimensionExpression {
    pub sql: String,
    pub effective_params: Map<String, Value>,
    pub family: TimeFamily,
}

struct SerialPart {
    sql: &'static str,
    zero_based: bool,
}

// Serial buckets count either epoch seconds or calendar fields from the
// $epoch anchor; both are evaluated in the requested timezone.
fn serial_part(units: &str) -> Option<SerialPart> {
    let (sql, zero_based): (&'static str, bool) = match units {
        "second" => ("FLOOR((date_part('epoch', $t) - date_part('epoch', $epoch)))", true),
        "minute" => ("FLOOR((date_part('epoch', $t) - date_part('epoch', $epoch))/60)", true),
        "hour" => ("FLOOR((date_part('epoch', $t) - date_part('epoch', $epoch))/3600)", true),
        "day" => ("1 + FLOOR((date_part('epoch', $t) - date_part('epoch', $epoch))/86400)", false),
        "week" => (
            "1 + FLOOR((date_part('epoch', $t) - date_part('epoch', $epoch))/(7*86400))",
            false,
        ),
        "month" => (
            "1 + date_part('month', $t) - date_part('month', $epoch) + 12*(date_part('year', $t)-date_part('year', $epoch))",
            false,
        ),
        "quarter" => (
            "1 + date_part('quarter', $t) - date_part('quarter', $epoch) + 4*(date_part('year', $t)-date_part('year', $epoch))",
            false,
        ),
        "semester" => (
            "1 + FLOOR((date_part('month', $t) - date_part('month', $epoch))/6) + 2*(date_part('year', $t)-date_part('year', $epoch))",
            false,
        ),
        "trimester" => (
            "1 + FLOOR((date_part('month', $t) - date_part('month', $epoch))/4) + 3*(date_part('year', $t)-date_part('year', $epoch))",
            false,
        ),
        // for the default epoch these coincide with date_part('year'/'decade'/...)
        "year" => ("1 + (date_part('year', $t)-date_part('year', $epoch))", false),
        "decade" => ("FLOOR(((date_part('year', $t)-date_part('year', $epoch)) + 1)/10)", true),
        "century" => ("1 + FLOOR((date_part('year', $t)-date_part('year', $epoch))/100)", false),
        "millennium" => ("1 + FLOOR((date_part('year', $t)-date_part('year', $epoch))/1000)", false),
        _ => return None,
    };
    Some(SerialPart { sql, zero_based })
}

fn iso_part(units: &str) -> Option<&'static str> {
    Some(match units {
        "second" => "to_char($t, 'YYYY-MM-DD\"T\"HH24:MI:SS')",
        "minute" => "to_char($t, 'YYYY-MM-DD\"T\"HH24:MI')",
        "hour" => "to_char($t, 'YYYY-MM-DD\"T\"HH24')",
        "day" => "to_char($t, 'YYYY-MM-DD')",
        "month" => "to_char($t, 'YYYY-MM')",
        "year" => "to_char($t, 'YYYY')",
        "week" => "to_char($t, 'IYYY-\"W\"IW')",
        "quarter" => "to_char($t, 'YYYY-\"Q\"Q')",
        "semester" => "to_char($t, 'YYYY\"S\"') || to_char(CEIL(date_part('month', $t)/6), '9')",
        "trimester" => "to_char($t, 'YYYY\"t\"') || to_char(CEIL(date_part('month', $t)/4), '9')",
        "decade" => "to_char(date_part('decade', $t), '\"D\"999')",
        "century" => "to_char($t, '\"C\"CC')",
        "millennium" => "to_char(date_part('millennium', $t), '\"M\"999')",
        _ => return None,
    })
}

fn cyclic_part(units: &str) -> Option<&'static str> {
    Some(match units {
        "dayOfWeek" => "date_part('isodow', $t)",          // 1 = monday to 7 = sunday
        "dayOfMonth" => "date_part('day', $t)",            // 1 to 31
        "dayOfYear" => "date_part('doy', $t)",             // 1 to 366
        "hourOfDay" => "date_part('hour', $t)",            // 0 to 23
        "monthOfYear" => "date_part('month', $t)",         // 1 to 12
        "quarterOfYear" => "date_part('quarter', $t)",     // 1 to 4
        "semesterOfYear" => "FLOOR((date_part('month', $t)-1)/6.0) + 1", // 1 to 2
        "trimesterOfYear" => "FLOOR((date_part('month', $t)-1)/4.0) + 1", // 1 to 3
        "weekOfYear" => "date_part('week', $t)",           // 1 to 53
        "minuteOfHour" => "date_part('minute', $t)",       // 0 to 59
        _ => return None,
    })
}

// Timezones can be a numeric offset in seconds or a (case-insensitive)
// tz/PG name; PG abbreviations are fixed offsets, general names handle DST.
fn timezone_expression(tz: &Value) -> String {
    match tz {
        Value::Number(n) => format!("INTERVAL '{n} seconds'"),
        Value::String(s) if s.parse::<f64>().map(f64::is_finite).unwrap_or(false) => {
            format!("INTERVAL '{s} seconds'")
        }
        other => {
            let name = match other {
                Value::String(s) => s.clone(),
                v => v.to_string(),
            };
            format!("'{name}'")
        }
    }
}

// The input is assumed to be a TIMESTAMP WITH TIME ZONE; a timezone
// parameter shifts it before bucketing.
fn time_expression(time: &str, timezone: Option<&Value>) -> String {
    match timezone {
        Some(tz) => format!("timezone({}, {})", timezone_expression(tz), time),
        None => time.to_string(),
    }
}

static EPOCH_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d\d\d\d)(?:-?(\d\d)(?:-?(\d\d)(?:[T\s]?(\d\d)(?:(\d\d)(?::(\d\d))?)?)?)?)?$")
        .expect("valid epoch regex")
});

/// Complete a partial ISO timestamp literal with field defaults
/// (`YYYY=0001, MM=01, DD=01, HH=00, MM=00, SS=00`).
pub fn epoch_with_defaults(epoch: Option<&str>) -> String {
    let captures = epoch.and_then(|e| EPOCH_FORMAT.captures(e));
    let field = |idx: usize, default: &str| -> String {
        captures
            .as_ref()
            .and_then(|c| c.get(idx))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| default.to_string())
    };
    format!(
        "{}-{}-{}T{}:{}:{}",
        field(1, "0001"),
        field(2, "01"),
        field(3, "01"),
        field(4, "00"),
        field(5, "00"),
        field(6, "00")
    )
}

// The epoch is an ISO timestamp literal without time zone, interpreted in
// the input timezone.
fn epoch_expression(epoch: &str) -> String {
    format!("TIMESTAMP '{epoch}'")
}

struct TimeParams {
    time: String,
    units: String,
    timezone: Option<Value>,
    count: u32,
    starting: Option<String>,
    format: Option<String>,
}

fn serial_sql_expr(params: &TimeParams) -> String {
    let part = serial_part(&params.units).expect("validated serial units");
    let column = time_expression(&params.time, params.timezone.as_ref());
    let epoch = epoch_expression(&epoch_with_defaults(params.starting.as_deref()));
    let serial = part.sql.replace("$t", &column).replace("$epoch", &epoch);
    if params.count != 1 {
        if part.zero_based {
            format!("FLOOR(({serial})/({}::double precision))::int", params.count)
        } else {
            format!("CEIL(({serial})/({}::double precision))::int", params.count)
        }
    } else {
        format!("({serial})::int")
    }
}

fn iso_sql_expr(params: &TimeParams) -> String {
    let column = time_expression(&params.time, params.timezone.as_ref());
    iso_part(&params.units)
        .expect("validated iso units")
        .replace("$t", &column)
}

fn cyclic_sql_expr(params: &TimeParams) -> String {
    let column = time_expression(&params.time, params.timezone.as_ref());
    cyclic_part(&params.units)
        .expect("validated cyclic units")
        .replace("$t", &column)
}

fn family_for(params: &Map<String, Value>) -> TimeFamily {
    let units = params.get("units").and_then(Value::as_str);
    if units.map(|u| cyclic_part(u).is_some()).unwrap_or(false) {
        TimeFamily::Cyclic
    } else if params.get("format").and_then(Value::as_str) == Some("iso") {
        TimeFamily::Iso
    } else {
        TimeFamily::Serial
    }
}

// Collect every validation violation before failing, so a bad request is
// reported in full.
fn validate(params: &Map<String, Value>, family: TimeFamily) -> Result<TimeParams> {
    let mut errors = Vec::new();

    let invalid: Vec<&str> = params
        .keys()
        .map(String::as_str)
        .filter(|key| !ACCEPTED_PARAMETERS.contains(key))
        .collect();
    if !invalid.is_empty() {
        errors.push(format!("Invalid parameters: {}", invalid.join(", ")));
    }
    let missing: Vec<&str> = REQUIRED_PARAMETERS
        .iter()
        .copied()
        .filter(|key| !params.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        errors.push(format!("Missing parameters: {}", missing.join(", ")));
    }

    let units = params
        .get("units")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let count = params
        .get("count")
        .and_then(Value::as_u64)
        .map(|c| c as u32)
        .unwrap_or(1);
    let mut starting = params
        .get("starting")
        .and_then(Value::as_str)
        .map(str::to_string);

    match family {
        TimeFamily::Cyclic => {
            if cyclic_part(&units).is_none() {
                errors.push(format!("Invalid units \"{units}\""));
            }
            if count > 1 {
                errors.push(format!("Count {count} not supported for cyclic {units}"));
            }
        }
        TimeFamily::Serial => {
            if serial_part(&units).is_none() {
                errors.push(format!("Invalid grouping units \"{units}\""));
            }
            starting = Some(epoch_with_defaults(starting.as_deref()));
        }
        TimeFamily::Iso => {
            if iso_part(&units).is_none() {
                errors.push(format!("Invalid units \"{units}\""));
            }
            if starting.is_some() {
                errors.push("Parameter 'starting' not supported for ISO format".to_string());
            }
            if count > 1 {
                errors.push("Multiple time units not supported for ISO format".to_string());
            }
        }
    }

    if !errors.is_empty() {
        return Err(TilegridError::TimeDimension(errors));
    }

    Ok(TimeParams {
        time: params
            .get("time")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        units,
        timezone: params.get("timezone").cloned(),
        count,
        starting,
        format: params.get("format").and_then(Value::as_str).map(str::to_string),
    })
}

fn effective_params(params: &TimeParams, family: TimeFamily) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("time".to_string(), Value::from(params.time.clone()));
    out.insert("units".to_string(), Value::from(params.units.clone()));
    if let Some(tz) = &params.timezone {
        out.insert("timezone".to_string(), tz.clone());
    }
    out.insert("count".to_string(), Value::from(params.count));
    if let Some(starting) = &params.starting {
        out.insert("starting".to_string(), Value::from(starting.clone()));
    }
    if let Some(format) = &params.format {
        out.insert("format".to_string(), Value::from(format.clone()));
    }
    out.insert("family".to_string(), Value::from(family.as_str()));
    out
}

/// Classify a time-dimension request into its SQL expression.
pub fn classify(params: &Map<String, Value>) -> Result<TimeDimensionExpression> {
    let family = family_for(params);
    let validated = validate(params, family)?;
    let sql = match family {
        TimeFamily::Cyclic => cyclic_sql_expr(&validated),
        TimeFamily::Serial => serial_sql_expr(&validated),
        TimeFamily::Iso => iso_sql_expr(&validated),
    };
    Ok(TimeDimensionExpression {
        sql,
        effective_params: effective_params(&validated, family),
        family,
    })
}
