//! EventBridge rules and SNS topics.

use super::cache::CloudWatchCache;
use crate::{
    cli::CliInvoker,
    error::{CloudError, ErrorKind},
    logging::event,
};
use serde::Deserialize;
use slog::{info, o, warn, Logger};

/// A rule target.
#[derive(Clone, Debug)]
pub struct EventTarget {
    pub id: String,
    pub arn: String,
    pub input: Option<String>,
}

/// Inputs for rule creation; either a schedule expression or an event
/// pattern must be present.
#[derive(Clone, Debug, Default)]
pub struct EventRuleConfig {
    pub name: String,
    pub schedule_expression: Option<String>,
    pub event_pattern: Option<String>,
    pub description: Option<String>,
    pub targets: Vec<EventTarget>,
}

/// A cached rule descriptor.
#[derive(Clone, Debug)]
pub struct EventRule {
    pub name: String,
    pub arn: Option<String>,
    pub schedule_expression: Option<String>,
    /// Targets successfully installed; target installation is best-effort.
    pub target_count: usize,
}

/// Inputs for topic creation.
#[derive(Clone, Debug, Default)]
pub struct SnsTopicConfig {
    pub name: String,
    pub display_name: Option<String>,
}

/// A cached topic descriptor.
#[derive(Clone, Debug)]
pub struct SnsTopic {
    pub name: String,
    pub arn: String,
    pub display_name: Option<String>,
}

mod wire {
    use super::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct PutRuleOutput {
        pub rule_arn: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct CreateTopicOutput {
        pub topic_arn: String,
    }
}

/// Installs event rules and their targets.
#[derive(Clone, Debug)]
pub struct EventsManager {
    invoker: CliInvoker,
    region: String,
    cache: CloudWatchCache,
    logger: Logger,
}

impl EventsManager {
    pub fn new(
        invoker: CliInvoker,
        region: impl Into<String>,
        cache: CloudWatchCache,
        parent_logger: &Logger,
    ) -> Self {
        EventsManager {
            invoker,
            region: region.into(),
            cache,
            logger: parent_logger.new(o!()),
        }
    }

    /// Installs the rule, then its targets in a second call. A target
    /// installation failure is logged and leaves the rule in place.
    pub fn create_event_rule(&self, config: &EventRuleConfig) -> Result<EventRule, CloudError> {
        if config.schedule_expression.is_none() && config.event_pattern.is_none() {
            return Err(CloudError::new(
                "aws",
                ErrorKind::InvalidRequest,
                "PutRule",
                "a schedule expression or an event pattern is required",
            ));
        }

        let mut args: Vec<String> = vec![
            "events".into(),
            "put-rule".into(),
            "--name".into(),
            config.name.clone(),
            "--region".into(),
            self.region.clone(),
        ];
        if let Some(schedule) = &config.schedule_expression {
            args.push("--schedule-expression".into());
            args.push(schedule.clone());
        }
        if let Some(pattern) = &config.event_pattern {
            args.push("--event-pattern".into());
            args.push(pattern.clone());
        }
        if let Some(description) = &config.description {
            args.push("--description".into());
            args.push(description.clone());
        }
        args.push("--output".into());
        args.push("json".into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let created: wire::PutRuleOutput = self.invoker.run_json("PutRule", &arg_refs)?;

        let mut target_count = 0;
        if !config.targets.is_empty() {
            let targets: Vec<serde_json::Value> = config
                .targets
                .iter()
                .map(|target| {
                    let mut rendered = serde_json::json!({"Id": target.id, "Arn": target.arn});
                    if let Some(input) = &target.input {
                        rendered["Input"] = serde_json::Value::String(input.clone());
                    }
                    rendered
                })
                .collect();
            let targets_doc = serde_json::Value::Array(targets).to_string();

            match self.invoker.run(
                "PutTargets",
                &[
                    "events",
                    "put-targets",
                    "--rule",
                    &config.name,
                    "--targets",
                    &targets_doc,
                    "--region",
                    &self.region,
                ],
            ) {
                Ok(_) => target_count = config.targets.len(),
                Err(e) => warn!(
                    self.logger, "failed to install rule targets";
                    event::RULE => &config.name,
                    "error" => e.to_string(),
                ),
            }
        }

        let rule = EventRule {
            name: config.name.clone(),
            arn: created.rule_arn,
            schedule_expression: config.schedule_expression.clone(),
            target_count,
        };
        self.cache.put_rule(rule.clone());
        info!(
            self.logger, "installed event rule";
            event::RULE => &config.name,
            "targets" => target_count,
        );
        Ok(rule)
    }

    pub fn delete_event_rule(&self, name: &str, target_ids: &[String]) -> Result<(), CloudError> {
        if !target_ids.is_empty() {
            let mut args: Vec<String> = vec![
                "events".into(),
                "remove-targets".into(),
                "--rule".into(),
                name.into(),
                "--region".into(),
                self.region.clone(),
                "--ids".into(),
            ];
            args.extend(target_ids.iter().cloned());
            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            if let Err(e) = self.invoker.run("RemoveTargets", &arg_refs) {
                warn!(
                    self.logger, "failed to remove rule targets";
                    event::RULE => name,
                    "error" => e.to_string(),
                );
            }
        }
        self.invoker
            .run(
                "DeleteRule",
                &[
                    "events",
                    "delete-rule",
                    "--name",
                    name,
                    "--region",
                    &self.region,
                ],
            )
            .map(|_| ())
    }
}

/// Creates topics and publishes notifications.
#[derive(Clone, Debug)]
pub struct SnsManager {
    invoker: CliInvoker,
    region: String,
    cache: CloudWatchCache,
    logger: Logger,
}

impl SnsManager {
    pub fn new(
        invoker: CliInvoker,
        region: impl Into<String>,
        cache: CloudWatchCache,
        parent_logger: &Logger,
    ) -> Self {
        SnsManager {
            invoker,
            region: region.into(),
            cache,
            logger: parent_logger.new(o!()),
        }
    }

    /// Creates the topic, then applies the display name when one was
    /// requested.
    pub fn create_topic(&self, config: &SnsTopicConfig) -> Result<SnsTopic, CloudError> {
        let created: wire::CreateTopicOutput = self.invoker.run_json(
            "CreateTopic",
            &[
                "sns",
                "create-topic",
                "--name",
                &config.name,
                "--region",
                &self.region,
                "--output",
                "json",
            ],
        )?;

        if let Some(display_name) = &config.display_name {
            self.invoker.run(
                "SetTopicAttributes",
                &[
                    "sns",
                    "set-topic-attributes",
                    "--topic-arn",
                    &created.topic_arn,
                    "--attribute-name",
                    "DisplayName",
                    "--attribute-value",
                    display_name,
                    "--region",
                    &self.region,
                ],
            )?;
        }

        let topic = SnsTopic {
            name: config.name.clone(),
            arn: created.topic_arn,
            display_name: config.display_name.clone(),
        };
        self.cache.put_topic(topic.clone());
        info!(self.logger, "created topic"; event::TOPIC => &config.name);
        Ok(topic)
    }

    pub fn publish(&self, topic_arn: &str, subject: &str, message: &str) -> Result<(), CloudError> {
        self.invoker
            .run(
                "Publish",
                &[
                    "sns",
                    "publish",
                    "--topic-arn",
                    topic_arn,
                    "--subject",
                    subject,
                    "--message",
                    message,
                    "--region",
                    &self.region,
                ],
            )
            .map(|_| ())
    }

    pub fn delete_topic(&self, topic_arn: &str) -> Result<(), CloudError> {
        self.invoker
            .run(
                "DeleteTopic",
                &[
                    "sns",
                    "delete-topic",
                    "--topic-arn",
                    topic_arn,
                    "--region",
                    &self.region,
                ],
            )
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{logging::setup_test_logging, metrics::CliMetricsCollector, test_utils::FakeCli};
    use assert_matches::assert_matches;

    fn managers_for(
        fake: &FakeCli,
        metric_name: &str,
    ) -> (EventsManager, SnsManager, CloudWatchCache) {
        let logger = setup_test_logging();
        let metrics = CliMetricsCollector::new_with_metric_name(metric_name).unwrap();
        let invoker = CliInvoker::new("aws", fake.program(), &logger, &metrics);
        let cache = CloudWatchCache::unbounded(&logger);
        (
            EventsManager::new(invoker.clone(), "us-east-1", cache.clone(), &logger),
            SnsManager::new(invoker, "us-east-1", cache.clone(), &logger),
            cache,
        )
    }

    #[test]
    fn rule_requires_schedule_or_pattern() {
        let fake = FakeCli::new("exit 1");
        let (events, _, cache) = managers_for(&fake, "events_requires_trigger");

        let err = events
            .create_event_rule(&EventRuleConfig {
                name: "apm-sweep".into(),
                ..Default::default()
            })
            .unwrap_err();
        assert_matches!(err.kind, ErrorKind::InvalidRequest);
        cache.close();
    }

    #[test]
    fn target_failure_is_non_fatal() {
        let fake = FakeCli::new(
            r#"case "$2" in
put-rule) echo '{"RuleArn":"arn:rule/apm-sweep"}';;
put-targets) echo 'An error occurred (AccessDenied)' 1>&2; exit 1;;
*) echo '{}';;
esac"#,
        );
        let (events, _, cache) = managers_for(&fake, "events_target_nonfatal");

        let rule = events
            .create_event_rule(&EventRuleConfig {
                name: "apm-sweep".into(),
                schedule_expression: Some("rate(5 minutes)".into()),
                targets: vec![EventTarget {
                    id: "sweep".into(),
                    arn: "arn:aws:lambda:us-east-1:1:function:sweep".into(),
                    input: None,
                }],
                ..Default::default()
            })
            .unwrap();

        assert_eq!(rule.arn.as_deref(), Some("arn:rule/apm-sweep"));
        assert_eq!(rule.target_count, 0);
        assert!(cache.get_rule("apm-sweep").is_some());
        cache.close();
    }

    #[test]
    fn topic_gets_optional_display_name() {
        let fake = FakeCli::new(
            r#"echo "$2" >> "$(dirname "$0")/log"
case "$2" in
create-topic) echo '{"TopicArn":"arn:aws:sns:us-east-1:1:apm-alerts"}';;
*) echo '{}';;
esac"#,
        );
        let (_, sns, cache) = managers_for(&fake, "sns_display_name");

        let topic = sns
            .create_topic(&SnsTopicConfig {
                name: "apm-alerts".into(),
                display_name: Some("APM Alerts".into()),
            })
            .unwrap();
        assert_eq!(topic.arn, "arn:aws:sns:us-east-1:1:apm-alerts");

        let calls = std::fs::read_to_string(fake.scratch_path("log")).unwrap();
        assert!(calls.contains("set-topic-attributes"));
        assert!(cache.get_topic("apm-alerts").is_some());

        // Without a display name the attribute call is skipped
        sns.create_topic(&SnsTopicConfig {
            name: "apm-plain".into(),
            display_name: None,
        })
        .unwrap();
        let calls = std::fs::read_to_string(fake.scratch_path("log")).unwrap();
        assert_eq!(calls.matches("set-topic-attributes").count(), 1);
        cache.close();
    }
}
