//! Typed health records and decoding of the vendor's JSON items into them.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::date_util::{from_unix, start_of_day};
use crate::error::{Error, Result};
use crate::sync::DataType;

/// Vendor measure type code for heart pulse.
pub const HEART_RATE_MEASURE_TYPE: i64 = 11;

/// Sleep summary fields requested from the vendor.
pub const SLEEP_FIELDS: &[&str] = &[
    "breathing_disturbances_intensity",
    "deepsleepduration",
    "durationtosleep",
    "durationtowakeup",
    "hr_average",
    "hr_max",
    "hr_min",
    "lightsleepduration",
    "remsleepduration",
    "rr_average",
    "rr_max",
    "rr_min",
    "sleep_score",
    "snoring",
    "snoringepisodecount",
    "total_sleep_time",
    "wakeupcount",
    "wakeupduration",
];

/// One health observation. `(data_type, source_id)` is its identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub data_type: DataType,
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
    /// The vendor item this record came from.
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Measurement {
        measure_type: String,
        type_code: i64,
        value: f64,
        unit: String,
        device_id: Option<String>,
        group_id: i64,
    },
    HeartRate {
        bpm: f64,
        device_id: Option<String>,
        group_id: i64,
    },
    Activity {
        date: NaiveDate,
        steps: Option<i64>,
        distance_m: Option<f64>,
        elevation_m: Option<f64>,
        calories: Option<f64>,
        total_calories: Option<f64>,
        soft_secs: Option<i64>,
        moderate_secs: Option<i64>,
        intense_secs: Option<i64>,
        active_secs: Option<i64>,
        hr_average: Option<f64>,
        hr_min: Option<f64>,
        hr_max: Option<f64>,
    },
    Sleep {
        end: DateTime<Utc>,
        duration_secs: i64,
        score: Option<i64>,
        deep_secs: Option<i64>,
        light_secs: Option<i64>,
        rem_secs: Option<i64>,
        awake_secs: Option<i64>,
        wakeup_count: Option<i64>,
        hr_average: Option<f64>,
        hr_min: Option<f64>,
        hr_max: Option<f64>,
        rr_average: Option<f64>,
        snoring_secs: Option<i64>,
    },
}

impl Payload {
    /// Canonical JSON used for storage and change detection.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Key in the response body that holds the item list for a type.
pub fn items_key(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Measurement | DataType::HeartRate => "measuregrps",
        DataType::Activity => "activities",
        DataType::Sleep => "series",
    }
}

/// Decode one vendor item. A measure group may yield several records.
pub fn decode_item(data_type: DataType, item: &Value) -> Result<Vec<Record>> {
    match data_type {
        DataType::Measurement => decode_measure_group(item),
        DataType::HeartRate => decode_heart_rate(item),
        DataType::Activity => decode_activity(item).map(|r| vec![r]),
        DataType::Sleep => decode_sleep(item).map(|r| vec![r]),
    }
}

fn decode_err(data_type: DataType, message: impl Into<String>) -> Error {
    Error::Decode {
        data_type,
        message: message.into(),
    }
}

fn parse<T: for<'de> Deserialize<'de>>(data_type: DataType, item: &Value) -> Result<T> {
    T::deserialize(item).map_err(|e| decode_err(data_type, e.to_string()))
}

fn timestamp(data_type: DataType, secs: i64) -> Result<DateTime<Utc>> {
    from_unix(secs).ok_or_else(|| decode_err(data_type, format!("timestamp {secs} out of range")))
}

#[derive(Deserialize)]
struct RawMeasureGroup {
    grpid: i64,
    date: i64,
    #[serde(default)]
    deviceid: Option<String>,
    #[serde(default)]
    measures: Vec<RawMeasure>,
}

#[derive(Deserialize)]
struct RawMeasure {
    value: i64,
    #[serde(rename = "type")]
    kind: i64,
    unit: i32,
}

impl RawMeasure {
    /// The vendor sends `value * 10^-unit` as two integers.
    fn real_value(&self) -> f64 {
        self.value as f64 * 10f64.powi(self.unit)
    }
}

fn decode_measure_group(item: &Value) -> Result<Vec<Record>> {
    let dt = DataType::Measurement;
    let group: RawMeasureGroup = parse(dt, item)?;
    let ts = timestamp(dt, group.date)?;
    group
        .measures
        .iter()
        .map(|m| {
            Ok(Record {
                data_type: dt,
                source_id: format!("{}:{}", group.grpid, m.kind),
                timestamp: ts,
                payload: Payload::Measurement {
                    measure_type: measure_type_name(m.kind),
                    type_code: m.kind,
                    value: m.real_value(),
                    unit: measure_unit(m.kind).to_string(),
                    device_id: group.deviceid.clone(),
                    group_id: group.grpid,
                },
                raw: item.clone(),
            })
        })
        .collect()
}

fn decode_heart_rate(item: &Value) -> Result<Vec<Record>> {
    let dt = DataType::HeartRate;
    let group: RawMeasureGroup = parse(dt, item)?;
    let ts = timestamp(dt, group.date)?;
    Ok(group
        .measures
        .iter()
        .find(|m| m.kind == HEART_RATE_MEASURE_TYPE)
        .map(|m| Record {
            data_type: dt,
            source_id: group.grpid.to_string(),
            timestamp: ts,
            payload: Payload::HeartRate {
                bpm: m.real_value(),
                device_id: group.deviceid.clone(),
                group_id: group.grpid,
            },
            raw: item.clone(),
        })
        .into_iter()
        .collect())
}

#[derive(Deserialize)]
struct RawActivity {
    date: String,
    steps: Option<i64>,
    distance: Option<f64>,
    elevation: Option<f64>,
    calories: Option<f64>,
    totalcalories: Option<f64>,
    soft: Option<i64>,
    moderate: Option<i64>,
    intense: Option<i64>,
    active: Option<i64>,
    hr_average: Option<f64>,
    hr_min: Option<f64>,
    hr_max: Option<f64>,
}

fn decode_activity(item: &Value) -> Result<Record> {
    let dt = DataType::Activity;
    let raw: RawActivity = parse(dt, item)?;
    let date = NaiveDate::parse_from_str(&raw.date, "%Y-%m-%d")
        .map_err(|e| decode_err(dt, format!("bad date '{}': {e}", raw.date)))?;
    Ok(Record {
        data_type: dt,
        source_id: raw.date.clone(),
        timestamp: start_of_day(date),
        payload: Payload::Activity {
            date,
            steps: raw.steps,
            distance_m: raw.distance,
            elevation_m: raw.elevation,
            calories: raw.calories,
            total_calories: raw.totalcalories,
            soft_secs: raw.soft,
            moderate_secs: raw.moderate,
            intense_secs: raw.intense,
            active_secs: raw.active,
            hr_average: raw.hr_average,
            hr_min: raw.hr_min,
            hr_max: raw.hr_max,
        },
        raw: item.clone(),
    })
}

#[derive(Deserialize)]
struct RawSleep {
    id: Option<i64>,
    startdate: i64,
    enddate: i64,
    #[serde(default)]
    data: RawSleepData,
}

#[derive(Deserialize, Default)]
struct RawSleepData {
    total_sleep_time: Option<i64>,
    sleep_score: Option<i64>,
    deepsleepduration: Option<i64>,
    lightsleepduration: Option<i64>,
    remsleepduration: Option<i64>,
    wakeupduration: Option<i64>,
    wakeupcount: Option<i64>,
    hr_average: Option<f64>,
    hr_min: Option<f64>,
    hr_max: Option<f64>,
    rr_average: Option<f64>,
    snoring: Option<i64>,
}

fn decode_sleep(item: &Value) -> Result<Record> {
    let dt = DataType::Sleep;
    let raw: RawSleep = parse(dt, item)?;
    let start = timestamp(dt, raw.startdate)?;
    let end = timestamp(dt, raw.enddate)?;
    if end < start {
        return Err(decode_err(dt, "sleep session ends before it starts"));
    }
    let data = raw.data;
    Ok(Record {
        data_type: dt,
        source_id: raw
            .id
            .map(|id| id.to_string())
            .unwrap_or_else(|| format!("start:{}", raw.startdate)),
        timestamp: start,
        payload: Payload::Sleep {
            end,
            duration_secs: data
                .total_sleep_time
                .unwrap_or_else(|| (end - start).num_seconds()),
            score: data.sleep_score,
            deep_secs: data.deepsleepduration,
            light_secs: data.lightsleepduration,
            rem_secs: data.remsleepduration,
            awake_secs: data.wakeupduration,
            wakeup_count: data.wakeupcount,
            hr_average: data.hr_average,
            hr_min: data.hr_min,
            hr_max: data.hr_max,
            rr_average: data.rr_average,
            snoring_secs: data.snoring,
        },
        raw: item.clone(),
    })
}

pub fn measure_type_name(code: i64) -> String {
    let name = match code {
        1 => "weight",
        4 => "height",
        5 => "fat_free_mass",
        6 => "fat_ratio",
        8 => "fat_mass",
        9 => "diastolic_blood_pressure",
        10 => "systolic_blood_pressure",
        11 => "heart_rate",
        12 => "temperature",
        54 => "spo2",
        71 => "body_temperature",
        73 => "skin_temperature",
        76 => "muscle_mass",
        77 => "hydration",
        88 => "bone_mass",
        91 => "pulse_wave_velocity",
        123 => "vo2_max",
        155 => "vascular_age",
        other => return format!("unknown_{other}"),
    };
    name.to_string()
}

pub fn measure_unit(code: i64) -> &'static str {
    match code {
        1 | 5 | 8 | 76 | 77 | 88 => "kg",
        4 => "m",
        6 | 54 => "%",
        9 | 10 => "mmHg",
        11 => "bpm",
        12 | 71 | 73 => "°C",
        91 => "m/s",
        123 => "ml/min/kg",
        155 => "years",
        _ => "unknown",
    }
}
