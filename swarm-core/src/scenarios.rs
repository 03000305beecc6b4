use std::sync::Arc;
use std::time::Duration;

use crate::config::{
    DEFAULT_EXEC, DEFAULT_GRACEFUL_RAMP_DOWN, DEFAULT_GRACEFUL_STOP, DEFAULT_MAX_DURATION,
    DEFAULT_SCENARIO, DEFAULT_TIME_UNIT, RunConfig, ScenarioConfig, ScenarioExecutor,
    ScenarioExecutorKind, Stage, total_stage_duration,
};
use crate::options::{ScenarioOptions, ScriptOptions};
use crate::{Error, MetricsContext, Result};

/// Resolves the options document into validated scenario configs.
///
/// Precedence: `scenarios`; else `stages` (ramping-vus); else `iterations` (shared-iterations);
/// else `duration` (constant-vus); else one iteration on one VU. Shape overrides in
/// [`RunConfig`] win over the document: every scenario keeps its name, `exec`, tags and
/// timing, but runs the shape described by the overrides.
pub fn scenarios_from_options(opts: &ScriptOptions, cfg: &RunConfig) -> Result<Vec<ScenarioConfig>> {
    let overrides_set = cfg.has_shape_overrides();

    if !opts.scenarios.is_empty() {
        let mut out = Vec::with_capacity(opts.scenarios.len());
        for (name, s) in &opts.scenarios {
            let scenario = scenario_from_options(name, s, opts, cfg, overrides_set)
                .map_err(|e| e.in_scenario(name))?;
            out.push(scenario);
        }
        return Ok(out);
    }

    let executor = if !overrides_set && !opts.stages.is_empty() {
        ramping_vus(
            opts.vus.unwrap_or(1),
            opts.stages.clone(),
            DEFAULT_GRACEFUL_RAMP_DOWN,
        )?
    } else {
        shortcut_executor(
            cfg.vus.or(opts.vus),
            cfg.iterations.or(opts.iterations),
            cfg.duration.or(opts.duration),
        )?
    };

    Ok(vec![ScenarioConfig {
        exec: DEFAULT_EXEC.to_string(),
        metrics_ctx: MetricsContext::new(Arc::from(DEFAULT_SCENARIO), Arc::from(Vec::new())),
        executor,
        start_time: Duration::ZERO,
        graceful_stop: DEFAULT_GRACEFUL_STOP,
    }])
}

fn scenario_from_options(
    name: &str,
    s: &ScenarioOptions,
    opts: &ScriptOptions,
    cfg: &RunConfig,
    overrides_set: bool,
) -> Result<ScenarioConfig> {
    if name.trim().is_empty() {
        return Err(Error::InvalidScenarioName(name.to_string()));
    }

    let exec = s.exec.clone().unwrap_or_else(|| DEFAULT_EXEC.to_string());
    let tags: Vec<(String, String)> = s.tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let metrics_ctx = MetricsContext::new(Arc::from(name), Arc::from(tags));

    let executor = if overrides_set {
        // Host overrides replace the scenario's shape; scenario-specific fields are ignored.
        shortcut_executor(
            cfg.vus.or(s.vus).or(opts.vus),
            cfg.iterations.or(s.iterations).or(opts.iterations),
            cfg.duration.or(s.duration).or(opts.duration),
        )?
    } else {
        executor_from_options(s)?
    };

    Ok(ScenarioConfig {
        exec,
        metrics_ctx,
        executor,
        start_time: s.start_time.unwrap_or(Duration::ZERO),
        graceful_stop: s.graceful_stop.unwrap_or(DEFAULT_GRACEFUL_STOP),
    })
}

fn executor_from_options(s: &ScenarioOptions) -> Result<ScenarioExecutor> {
    let executor_name = s.executor.as_deref().unwrap_or("constant-vus");
    let kind: ScenarioExecutorKind = executor_name
        .parse()
        .map_err(|_| Error::InvalidExecutor(executor_name.to_string()))?;

    match kind {
        ScenarioExecutorKind::SharedIterations => {
            let vus = positive(s.vus.unwrap_or(1), Error::InvalidVus)?;
            let iterations = positive(s.iterations.unwrap_or(1), Error::InvalidIterations)?;
            if iterations < vus {
                return Err(Error::InvalidIterations);
            }
            Ok(ScenarioExecutor::SharedIterations {
                vus,
                iterations,
                max_duration: max_duration(s.max_duration)?,
            })
        }
        ScenarioExecutorKind::PerVuIterations => Ok(ScenarioExecutor::PerVuIterations {
            vus: positive(s.vus.unwrap_or(1), Error::InvalidVus)?,
            iterations: positive(s.iterations.unwrap_or(1), Error::InvalidIterations)?,
            max_duration: max_duration(s.max_duration)?,
        }),
        ScenarioExecutorKind::ConstantVus => {
            let duration = s.duration.ok_or(Error::InvalidDuration)?;
            Ok(ScenarioExecutor::ConstantVus {
                vus: positive(s.vus.unwrap_or(1), Error::InvalidVus)?,
                duration: positive_duration(duration, Error::InvalidDuration)?,
            })
        }
        ScenarioExecutorKind::RampingVus => {
            if s.iterations.is_some() {
                return Err(Error::InvalidIterations);
            }
            ramping_vus(
                s.start_vus.unwrap_or(1),
                s.stages.clone(),
                s.graceful_ramp_down.unwrap_or(DEFAULT_GRACEFUL_RAMP_DOWN),
            )
        }
        ScenarioExecutorKind::ConstantArrivalRate => {
            let rate = positive(s.rate.unwrap_or(0), Error::InvalidRate)?;
            let duration = s.duration.ok_or(Error::InvalidDuration)?;
            let (pre_allocated_vus, max_vus) = arrival_vus(s)?;
            Ok(ScenarioExecutor::ConstantArrivalRate {
                rate,
                time_unit: time_unit(s.time_unit)?,
                duration: positive_duration(duration, Error::InvalidDuration)?,
                pre_allocated_vus,
                max_vus,
            })
        }
        ScenarioExecutorKind::RampingArrivalRate => {
            if s.iterations.is_some() {
                return Err(Error::InvalidIterations);
            }
            let stages = validated_stages(s.stages.clone())?;
            let (pre_allocated_vus, max_vus) = arrival_vus(s)?;
            Ok(ScenarioExecutor::RampingArrivalRate {
                start_rate: s.start_rate.unwrap_or(0),
                time_unit: time_unit(s.time_unit)?,
                pre_allocated_vus,
                max_vus,
                stages,
            })
        }
    }
}

fn shortcut_executor(
    vus: Option<u64>,
    iterations: Option<u64>,
    duration: Option<Duration>,
) -> Result<ScenarioExecutor> {
    let vus = positive(vus.unwrap_or(1), Error::InvalidVus)?;

    if let Some(iterations) = iterations {
        let iterations = positive(iterations, Error::InvalidIterations)?;
        if iterations < vus {
            return Err(Error::InvalidIterations);
        }
        // With `iterations`, `duration` caps the run instead of driving it.
        return Ok(ScenarioExecutor::SharedIterations {
            vus,
            iterations,
            max_duration: max_duration(duration)?,
        });
    }

    if let Some(duration) = duration {
        return Ok(ScenarioExecutor::ConstantVus {
            vus,
            duration: positive_duration(duration, Error::InvalidDuration)?,
        });
    }

    Ok(ScenarioExecutor::PerVuIterations {
        vus,
        iterations: 1,
        max_duration: DEFAULT_MAX_DURATION,
    })
}

fn ramping_vus(
    start_vus: u64,
    stages: Vec<Stage>,
    graceful_ramp_down: Duration,
) -> Result<ScenarioExecutor> {
    let stages = validated_stages(stages)?;
    let peak = stages.iter().map(|st| st.target).max().unwrap_or(0);
    if peak.max(start_vus) == 0 {
        return Err(Error::InvalidVus);
    }
    Ok(ScenarioExecutor::RampingVus {
        start_vus,
        stages,
        graceful_ramp_down,
    })
}

fn validated_stages(stages: Vec<Stage>) -> Result<Vec<Stage>> {
    if stages.is_empty() || total_stage_duration(&stages).is_zero() {
        return Err(Error::InvalidStages);
    }
    Ok(stages)
}

fn arrival_vus(s: &ScenarioOptions) -> Result<(u64, u64)> {
    let pre_allocated_vus = positive(s.pre_allocated_vus.unwrap_or(1), Error::InvalidPreAllocatedVus)?;
    let max_vus = s.max_vus.unwrap_or(pre_allocated_vus);
    if max_vus < pre_allocated_vus {
        return Err(Error::InvalidMaxVus);
    }
    Ok((pre_allocated_vus, max_vus))
}

fn time_unit(raw: Option<Duration>) -> Result<Duration> {
    positive_duration(raw.unwrap_or(DEFAULT_TIME_UNIT), Error::InvalidTimeUnit)
}

fn max_duration(raw: Option<Duration>) -> Result<Duration> {
    positive_duration(raw.unwrap_or(DEFAULT_MAX_DURATION), Error::InvalidDuration)
}

fn positive(v: u64, err: Error) -> Result<u64> {
    if v == 0 { Err(err) } else { Ok(v) }
}

fn positive_duration(d: Duration, err: Error) -> Result<Duration> {
    if d.is_zero() { Err(err) } else { Ok(d) }
}
