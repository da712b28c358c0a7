//! Metric alarms with the tri-state alarm model.

use super::cache::CloudWatchCache;
use crate::{
    cli::CliInvoker,
    error::{CloudError, ErrorKind},
    logging::event,
};
use serde::Deserialize;
use slog::{info, o, Logger};
use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    str::FromStr,
};

/// The three states an alarm can report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlarmState {
    Ok,
    Alarm,
    InsufficientData,
}

impl AlarmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmState::Ok => "OK",
            AlarmState::Alarm => "ALARM",
            AlarmState::InsufficientData => "INSUFFICIENT_DATA",
        }
    }
}

impl Display for AlarmState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlarmState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "OK" => Ok(AlarmState::Ok),
            "ALARM" => Ok(AlarmState::Alarm),
            "INSUFFICIENT_DATA" => Ok(AlarmState::InsufficientData),
            other => Err(format!("unknown alarm state {other:?}")),
        }
    }
}

/// Inputs for alarm creation.
#[derive(Clone, Debug)]
pub struct AlarmConfig {
    pub name: String,
    pub description: Option<String>,
    pub namespace: String,
    pub metric_name: String,
    pub statistic: String,
    pub period: i64,
    pub evaluation_periods: i64,
    pub threshold: f64,
    pub comparison_operator: String,
    pub treat_missing_data: Option<String>,
    pub dimensions: HashMap<String, String>,
    pub ok_actions: Vec<String>,
    pub alarm_actions: Vec<String>,
    pub insufficient_data_actions: Vec<String>,
}

impl AlarmConfig {
    /// A threshold alarm with the usual defaults.
    pub fn threshold_alarm(
        name: impl Into<String>,
        namespace: impl Into<String>,
        metric_name: impl Into<String>,
        threshold: f64,
    ) -> Self {
        AlarmConfig {
            name: name.into(),
            description: None,
            namespace: namespace.into(),
            metric_name: metric_name.into(),
            statistic: "Average".to_owned(),
            period: 300,
            evaluation_periods: 2,
            threshold,
            comparison_operator: "GreaterThanThreshold".to_owned(),
            treat_missing_data: Some("notBreaching".to_owned()),
            dimensions: HashMap::new(),
            ok_actions: Vec::new(),
            alarm_actions: Vec::new(),
            insufficient_data_actions: Vec::new(),
        }
    }
}

/// A cached alarm descriptor.
#[derive(Clone, Debug)]
pub struct Alarm {
    pub name: String,
    pub region: String,
    pub namespace: String,
    pub metric_name: String,
    pub threshold: f64,
    pub comparison_operator: String,
    pub state: AlarmState,
    pub actions_enabled: bool,
    pub ok_actions: Vec<String>,
    pub alarm_actions: Vec<String>,
    pub insufficient_data_actions: Vec<String>,
}

mod wire {
    use super::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct DescribeAlarmsOutput {
        #[serde(default)]
        pub metric_alarms: Vec<MetricAlarm>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct MetricAlarm {
        pub state_value: String,
    }
}

/// Creates and toggles metric alarms.
#[derive(Clone, Debug)]
pub struct AlarmManager {
    invoker: CliInvoker,
    region: String,
    cache: CloudWatchCache,
    logger: Logger,
}

impl AlarmManager {
    pub fn new(
        invoker: CliInvoker,
        region: impl Into<String>,
        cache: CloudWatchCache,
        parent_logger: &Logger,
    ) -> Self {
        AlarmManager {
            invoker,
            region: region.into(),
            cache,
            logger: parent_logger.new(o!()),
        }
    }

    /// Translates the config into a `put-metric-alarm` call. The alarm
    /// starts in `INSUFFICIENT_DATA` until the service evaluates it.
    pub fn create_alarm(&self, config: &AlarmConfig) -> Result<Alarm, CloudError> {
        let period = config.period.to_string();
        let evaluation_periods = config.evaluation_periods.to_string();
        let threshold = config.threshold.to_string();

        let mut args: Vec<String> = vec![
            "cloudwatch".into(),
            "put-metric-alarm".into(),
            "--alarm-name".into(),
            config.name.clone(),
            "--namespace".into(),
            config.namespace.clone(),
            "--metric-name".into(),
            config.metric_name.clone(),
            "--statistic".into(),
            config.statistic.clone(),
            "--period".into(),
            period,
            "--evaluation-periods".into(),
            evaluation_periods,
            "--threshold".into(),
            threshold,
            "--comparison-operator".into(),
            config.comparison_operator.clone(),
            "--region".into(),
            self.region.clone(),
        ];
        if let Some(description) = &config.description {
            args.push("--alarm-description".into());
            args.push(description.clone());
        }
        if let Some(treatment) = &config.treat_missing_data {
            args.push("--treat-missing-data".into());
            args.push(treatment.clone());
        }
        if !config.dimensions.is_empty() {
            args.push("--dimensions".into());
            for (name, value) in &config.dimensions {
                args.push(format!("Name={name},Value={value}"));
            }
        }
        if !config.ok_actions.is_empty() {
            args.push("--ok-actions".into());
            args.extend(config.ok_actions.iter().cloned());
        }
        if !config.alarm_actions.is_empty() {
            args.push("--alarm-actions".into());
            args.extend(config.alarm_actions.iter().cloned());
        }
        if !config.insufficient_data_actions.is_empty() {
            args.push("--insufficient-data-actions".into());
            args.extend(config.insufficient_data_actions.iter().cloned());
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.invoker.run("PutMetricAlarm", &arg_refs)?;

        let alarm = Alarm {
            name: config.name.clone(),
            region: self.region.clone(),
            namespace: config.namespace.clone(),
            metric_name: config.metric_name.clone(),
            threshold: config.threshold,
            comparison_operator: config.comparison_operator.clone(),
            state: AlarmState::InsufficientData,
            actions_enabled: true,
            ok_actions: config.ok_actions.clone(),
            alarm_actions: config.alarm_actions.clone(),
            insufficient_data_actions: config.insufficient_data_actions.clone(),
        };
        self.cache.put_alarm(alarm.clone());
        info!(self.logger, "created alarm"; event::ALARM => &config.name);
        Ok(alarm)
    }

    /// Re-enables the alarm's actions. Only the action toggle changes; the
    /// rest of the alarm configuration is untouched.
    pub fn enable_alarm(&self, name: &str) -> Result<(), CloudError> {
        self.invoker.run(
            "EnableAlarmActions",
            &[
                "cloudwatch",
                "enable-alarm-actions",
                "--alarm-names",
                name,
                "--region",
                &self.region,
            ],
        )?;
        self.cache.update_alarm(name, |alarm| alarm.actions_enabled = true);
        Ok(())
    }

    /// Disables the alarm's actions; see [`enable_alarm`](Self::enable_alarm).
    pub fn disable_alarm(&self, name: &str) -> Result<(), CloudError> {
        self.invoker.run(
            "DisableAlarmActions",
            &[
                "cloudwatch",
                "disable-alarm-actions",
                "--alarm-names",
                name,
                "--region",
                &self.region,
            ],
        )?;
        self.cache.update_alarm(name, |alarm| alarm.actions_enabled = false);
        Ok(())
    }

    /// The alarm's current tri-state.
    pub fn get_alarm_state(&self, name: &str) -> Result<AlarmState, CloudError> {
        let output: wire::DescribeAlarmsOutput = self.invoker.run_json(
            "DescribeAlarms",
            &[
                "cloudwatch",
                "describe-alarms",
                "--alarm-names",
                name,
                "--region",
                &self.region,
                "--output",
                "json",
            ],
        )?;
        let alarm = output.metric_alarms.into_iter().next().ok_or_else(|| {
            CloudError::new(
                "aws",
                ErrorKind::ObjectNotFound,
                "DescribeAlarms",
                format!("alarm {name} not found"),
            )
        })?;
        let state = AlarmState::from_str(&alarm.state_value).map_err(|reason| {
            CloudError::new("aws", ErrorKind::Unknown, "DescribeAlarms", reason)
        })?;
        self.cache.update_alarm(name, |alarm| alarm.state = state);
        Ok(state)
    }

    pub fn delete_alarm(&self, name: &str) -> Result<(), CloudError> {
        self.invoker.run(
            "DeleteAlarms",
            &[
                "cloudwatch",
                "delete-alarms",
                "--alarm-names",
                name,
                "--region",
                &self.region,
            ],
        )?;
        self.cache.remove_alarm(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{logging::setup_test_logging, metrics::CliMetricsCollector, test_utils::FakeCli};
    use assert_matches::assert_matches;

    fn manager_for(fake: &FakeCli, metric_name: &str) -> (AlarmManager, CloudWatchCache) {
        let logger = setup_test_logging();
        let metrics = CliMetricsCollector::new_with_metric_name(metric_name).unwrap();
        let invoker = CliInvoker::new("aws", fake.program(), &logger, &metrics);
        let cache = CloudWatchCache::unbounded(&logger);
        (
            AlarmManager::new(invoker, "us-east-1", cache.clone(), &logger),
            cache,
        )
    }

    #[test]
    fn alarm_state_round_trip() {
        for state in [AlarmState::Ok, AlarmState::Alarm, AlarmState::InsufficientData] {
            assert_eq!(AlarmState::from_str(state.as_str()).unwrap(), state);
        }
        AlarmState::from_str("PENDING").unwrap_err();
    }

    #[test]
    fn toggling_actions_leaves_config_untouched() {
        let fake = FakeCli::new("echo '{}'");
        let (manager, cache) = manager_for(&fake, "alarms_toggle");

        let created = manager
            .create_alarm(&AlarmConfig::threshold_alarm(
                "apm-error-rate",
                "APM/Prometheus",
                "ErrorRate",
                5.0,
            ))
            .unwrap();
        assert!(created.actions_enabled);

        manager.disable_alarm("apm-error-rate").unwrap();
        let disabled = cache.get_alarm("apm-error-rate").unwrap();
        assert!(!disabled.actions_enabled);
        // Everything but the toggle is identical
        assert_eq!(disabled.threshold, created.threshold);
        assert_eq!(disabled.metric_name, created.metric_name);
        assert_eq!(disabled.comparison_operator, created.comparison_operator);
        assert_eq!(disabled.alarm_actions, created.alarm_actions);

        manager.enable_alarm("apm-error-rate").unwrap();
        assert!(cache.get_alarm("apm-error-rate").unwrap().actions_enabled);
        cache.close();
    }

    #[test]
    fn state_lookup_parses_tristate() {
        let fake = FakeCli::new(
            r#"case "$2" in
describe-alarms) echo '{"MetricAlarms":[{"StateValue":"ALARM"}]}';;
*) echo '{}';;
esac"#,
        );
        let (manager, cache) = manager_for(&fake, "alarms_state");

        let state = manager.get_alarm_state("apm-error-rate").unwrap();
        assert_eq!(state, AlarmState::Alarm);
        cache.close();
    }

    #[test]
    fn missing_alarm_is_not_found() {
        let fake = FakeCli::new(r#"echo '{"MetricAlarms":[]}'"#);
        let (manager, cache) = manager_for(&fake, "alarms_missing");

        let err = manager.get_alarm_state("ghost").unwrap_err();
        assert_matches!(err.kind, ErrorKind::ObjectNotFound);
        cache.close();
    }
}
