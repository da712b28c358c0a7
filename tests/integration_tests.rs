//! End-to-end exercises against stub vendor CLIs.

use multicloud::{
    cli::CliInvoker,
    credentials::{assume_role_chain, AssumeRoleOptions, ChainStep},
    logging::setup_test_logging,
    metrics::CliMetricsCollector,
    test_utils::FakeCli,
};
use std::{env, sync::Mutex};

// Role chains mutate the process-wide credential environment, so the tests
// that drive them must not interleave.
static ENV_LOCK: Mutex<()> = Mutex::new(());

/// A stub `aws sts` that mints a distinct access key per invocation and
/// records the access key the *caller* had in its environment, which is how
/// the chain invariant (step N runs under step N−1's credentials) becomes
/// observable.
fn chain_script() -> &'static str {
    r#"dir="$(dirname "$0")"
echo "${AWS_ACCESS_KEY_ID:-<unset>}" >> "$dir/env_log"
count_file="$dir/count"
count="$(cat "$count_file" 2>/dev/null || echo 0)"
count=$((count + 1))
echo "$count" > "$count_file"
cat <<EOF
{
    "Credentials": {
        "AccessKeyId": "ASIA-STEP$count",
        "SecretAccessKey": "secret-$count",
        "SessionToken": "token-$count",
        "Expiration": "2030-01-01T00:00:00+00:00"
    },
    "AssumedRoleUser": {
        "AssumedRoleId": "AROAFAKE:chain",
        "Arn": "arn:aws:sts::222222222222:assumed-role/APMReader/chain"
    }
}
EOF"#
}

#[test]
fn role_chain_runs_each_step_under_previous_credentials() {
    let _env = ENV_LOCK.lock().unwrap();
    let fake = FakeCli::new(chain_script());
    let logger = setup_test_logging();
    let metrics = CliMetricsCollector::new_with_metric_name("it_role_chain").unwrap();
    let invoker = CliInvoker::new("aws", fake.program(), &logger, &metrics);

    // This test owns the credential environment for the process
    env::set_var("AWS_ACCESS_KEY_ID", "AKIA-ORIGINAL");
    env::set_var("AWS_SECRET_ACCESS_KEY", "original-secret");
    env::remove_var("AWS_SESSION_TOKEN");

    let chain = vec![
        ChainStep {
            role_arn: "arn:aws:iam::111111111111:role/APMHub".to_owned(),
            options: AssumeRoleOptions {
                session_name: Some("hop-one".to_owned()),
                ..Default::default()
            },
        },
        ChainStep {
            role_arn: "arn:aws:iam::222222222222:role/APMReader".to_owned(),
            options: AssumeRoleOptions {
                session_name: Some("hop-two".to_owned()),
                external_id: Some("abc-123".to_owned()),
                ..Default::default()
            },
        },
    ];

    let credentials = assume_role_chain(&invoker, &logger, &chain).unwrap();
    assert_eq!(credentials.len(), 2);

    // The operative identity is the last hop, in the target account
    let last = &credentials[1];
    assert_eq!(last.account_id.as_deref(), Some("222222222222"));
    assert_eq!(
        last.properties["role_arn"],
        "arn:aws:iam::222222222222:role/APMReader"
    );
    assert_eq!(last.access_key_id.as_deref(), Some("ASIA-STEP2"));

    // Step 1 saw the original environment; step 2 saw step 1's tokens
    let env_log = std::fs::read_to_string(fake.scratch_path("env_log")).unwrap();
    let seen: Vec<&str> = env_log.lines().collect();
    assert_eq!(seen, vec!["AKIA-ORIGINAL", "ASIA-STEP1"]);

    // The process environment is restored regardless of outcome
    assert_eq!(env::var("AWS_ACCESS_KEY_ID").unwrap(), "AKIA-ORIGINAL");
    assert_eq!(env::var("AWS_SECRET_ACCESS_KEY").unwrap(), "original-secret");
    assert!(env::var("AWS_SESSION_TOKEN").is_err());

    env::remove_var("AWS_ACCESS_KEY_ID");
    env::remove_var("AWS_SECRET_ACCESS_KEY");
}

#[test]
fn failed_chain_step_still_restores_the_environment() {
    let _env = ENV_LOCK.lock().unwrap();
    // The script fails on the second call, mid-chain
    let script = r#"dir="$(dirname "$0")"
count_file="$dir/count"
count="$(cat "$count_file" 2>/dev/null || echo 0)"
count=$((count + 1))
echo "$count" > "$count_file"
if [ "$count" -ge 2 ]; then
    echo 'An error occurred (AccessDenied) when calling the AssumeRole operation' 1>&2
    exit 254
fi
cat <<EOF
{
    "Credentials": {
        "AccessKeyId": "ASIA-ONLY",
        "SecretAccessKey": "secret",
        "SessionToken": "token",
        "Expiration": "2030-01-01T00:00:00+00:00"
    },
    "AssumedRoleUser": {
        "AssumedRoleId": "AROAFAKE:chain",
        "Arn": "arn:aws:sts::111111111111:assumed-role/APMHub/chain"
    }
}
EOF"#;

    let fake = FakeCli::new(script);
    let logger = setup_test_logging();
    let metrics = CliMetricsCollector::new_with_metric_name("it_failed_chain").unwrap();
    let invoker = CliInvoker::new("aws", fake.program(), &logger, &metrics);

    let chain = vec![
        ChainStep {
            role_arn: "arn:aws:iam::111111111111:role/APMHub".to_owned(),
            options: AssumeRoleOptions::default(),
        },
        ChainStep {
            role_arn: "arn:aws:iam::222222222222:role/Denied".to_owned(),
            options: AssumeRoleOptions::default(),
        },
    ];

    let before = env::var("AWS_ACCESS_KEY_ID").ok();
    let err = assume_role_chain(&invoker, &logger, &chain).unwrap_err();
    assert!(err.operation.contains("AssumeRoleChain[1]"));
    assert_eq!(env::var("AWS_ACCESS_KEY_ID").ok(), before);
}
