use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::Result;
use crate::config::Stage;

/// Parsed options document.
///
/// Top-level `vus` / `iterations` / `duration` / `stages` are shortcuts for a single
/// `default` scenario and are ignored when `scenarios` is present.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptOptions {
    pub vus: Option<u64>,
    pub iterations: Option<u64>,
    #[serde(deserialize_with = "de_opt_duration")]
    pub duration: Option<Duration>,
    pub stages: Vec<Stage>,

    pub scenarios: BTreeMap<String, ScenarioOptions>,
    pub thresholds: BTreeMap<String, ThresholdOptions>,

    #[serde(deserialize_with = "de_opt_duration")]
    pub setup_timeout: Option<Duration>,
    #[serde(deserialize_with = "de_opt_duration")]
    pub teardown_timeout: Option<Duration>,

    /// Redirects each request follows. Overrides the host's client options.
    pub max_redirects: Option<u32>,
}

impl ScriptOptions {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScenarioOptions {
    /// Executor kind: shared-iterations | per-vu-iterations | constant-vus | ramping-vus |
    /// constant-arrival-rate | ramping-arrival-rate
    pub executor: Option<String>,

    /// Entry function name.
    pub exec: Option<String>,

    /// Scenario-level tags.
    #[serde(deserialize_with = "de_tags")]
    pub tags: BTreeMap<String, String>,

    #[serde(deserialize_with = "de_opt_duration")]
    pub start_time: Option<Duration>,
    #[serde(deserialize_with = "de_opt_duration")]
    pub graceful_stop: Option<Duration>,

    pub vus: Option<u64>,
    pub iterations: Option<u64>,
    #[serde(deserialize_with = "de_opt_duration")]
    pub duration: Option<Duration>,
    #[serde(deserialize_with = "de_opt_duration")]
    pub max_duration: Option<Duration>,

    // ramping-vus
    #[serde(rename = "startVUs")]
    pub start_vus: Option<u64>,
    pub stages: Vec<Stage>,
    #[serde(deserialize_with = "de_opt_duration")]
    pub graceful_ramp_down: Option<Duration>,

    // arrival-rate
    pub rate: Option<u64>,
    pub start_rate: Option<u64>,
    #[serde(deserialize_with = "de_opt_duration")]
    pub time_unit: Option<Duration>,
    #[serde(rename = "preAllocatedVUs")]
    pub pre_allocated_vus: Option<u64>,
    #[serde(rename = "maxVUs")]
    pub max_vus: Option<u64>,
}

/// Threshold entry: one expression, or a list of expressions and/or objects.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ThresholdOptions {
    One(String),
    Many(Vec<ThresholdEntry>),
}

impl ThresholdOptions {
    pub fn entries(&self) -> Vec<ThresholdEntry> {
        match self {
            ThresholdOptions::One(s) => vec![ThresholdEntry::Expr(s.clone())],
            ThresholdOptions::Many(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ThresholdEntry {
    Expr(String),
    Object(ThresholdObject),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdObject {
    pub threshold: String,
    #[serde(default)]
    pub abort_on_fail: bool,
    #[serde(default, deserialize_with = "de_opt_duration")]
    pub delay_abort_eval: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
struct OptDuration(Duration);

impl<'de> Deserialize<'de> for OptDuration {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = OptDuration;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("duration as string (e.g. 10s), integer seconds, or float seconds")
            }

            fn visit_u64<E>(self, v: u64) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(OptDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E>(self, v: i64) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let secs = u64::try_from(v).map_err(|_| E::custom("duration must not be negative"))?;
                Ok(OptDuration(Duration::from_secs(secs)))
            }

            fn visit_f64<E>(self, v: f64) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if !v.is_finite() || v < 0.0 {
                    return Err(E::custom("duration must be a non-negative, finite number"));
                }
                Ok(OptDuration(Duration::from_secs_f64(v)))
            }

            fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let v = v.trim();
                if v == "0" {
                    return Ok(OptDuration(Duration::ZERO));
                }
                let d = humantime::parse_duration(v).map_err(E::custom)?;
                Ok(OptDuration(d))
            }
        }

        deserializer.deserialize_any(V)
    }
}

pub(crate) fn de_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    OptDuration::deserialize(deserializer).map(|d| d.0)
}

pub(crate) fn de_opt_duration<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<OptDuration>::deserialize(deserializer).map(|d| d.map(|d| d.0))
}

fn de_tags<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
    let mut out = BTreeMap::new();

    for (k, v) in raw {
        let s = match v {
            serde_json::Value::Null => continue,
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => s,
            _ => continue,
        };
        out.insert(k, s);
    }

    Ok(out)
}
