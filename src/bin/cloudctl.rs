use clap::{crate_version, App, AppSettings, Arg, ArgMatches, SubCommand};
use multicloud::{
    cloudwatch::{DashboardConfig, DashboardTemplate},
    config::{ConfigLocation, MultiAccountConfig, ProviderConfig, ProviderKind},
    credentials::AssumeRoleOptions,
    ecr::{BuildPushOptions, EcrLoginOptions},
    eks::KubeconfigOptions,
    cloudformation::StackFilters,
    logging::{setup_logging, LoggingConfiguration},
    metrics::{start_metrics_scrape_endpoint, MetricsBundle},
    provider::{CloudProvider, ProviderFactory},
    s3::{ApmConfigStore, ApmTool, BucketOptions, UploadOptions},
    Error,
};
use slog::{info, o, Logger};
use std::{path::PathBuf, str::FromStr, time::Duration};
use uuid::Uuid;

fn u16_validator(s: String) -> Result<(), String> {
    s.parse::<u16>().map(|_| ()).map_err(|e| e.to_string())
}

fn u64_validator(s: String) -> Result<(), String> {
    s.parse::<u64>().map(|_| ()).map_err(|e| e.to_string())
}

fn tool_validator(s: String) -> Result<(), String> {
    ApmTool::from_str(&s).map(|_| ())
}

fn template_validator(s: String) -> Result<(), String> {
    DashboardTemplate::from_str(&s).map(|_| ())
}

fn provider_validator(s: String) -> Result<(), String> {
    ProviderKind::from_str(&s).map(|_| ())
}

fn required<'a>(matches: &'a ArgMatches, name: &'static str) -> Result<&'a str, Error> {
    matches.value_of(name).ok_or(Error::MissingArguments(name))
}

fn comma_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

fn main() -> Result<(), Error> {
    let matches = App::new("cloudctl")
        .about("Multi-cloud orchestration toolkit for APM infrastructure")
        .version(crate_version!())
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("v")
                .help("Enable verbose output to stderr"),
        )
        .arg(
            Arg::with_name("json-log")
                .long("json-log")
                .help("Force JSON log output even on a tty"),
        )
        .arg(
            Arg::with_name("provider")
                .long("provider")
                .takes_value(true)
                .default_value("aws")
                .validator(provider_validator)
                .help("Cloud provider to operate against"),
        )
        .arg(
            Arg::with_name("region")
                .long("region")
                .takes_value(true)
                .help("Region override for this invocation"),
        )
        .arg(
            Arg::with_name("profile")
                .long("profile")
                .takes_value(true)
                .help("Named CLI profile to resolve credentials from"),
        )
        .arg(
            Arg::with_name("metrics-port")
                .long("metrics-port")
                .takes_value(true)
                .validator(u16_validator)
                .help("Expose Prometheus metrics scrapes on this port"),
        )
        .subcommand(SubCommand::with_name("identity").about("Print the current caller identity"))
        .subcommand(
            SubCommand::with_name("assume-role")
                .about("Assume a role, optionally with an external ID")
                .arg(
                    Arg::with_name("role-arn")
                        .long("role-arn")
                        .takes_value(true)
                        .required(true),
                )
                .arg(Arg::with_name("external-id").long("external-id").takes_value(true))
                .arg(Arg::with_name("session-name").long("session-name").takes_value(true))
                .arg(
                    Arg::with_name("duration-seconds")
                        .long("duration-seconds")
                        .takes_value(true)
                        .validator(u64_validator),
                ),
        )
        .subcommand(
            SubCommand::with_name("accounts")
                .about("Show the multi-account configuration")
                .arg(
                    Arg::with_name("config")
                        .long("config")
                        .takes_value(true)
                        .required(true)
                        .help("Local path or s3://bucket/key"),
                ),
        )
        .subcommand(
            SubCommand::with_name("validate-role")
                .about("Inspect a role's trust policy for assumption requirements")
                .arg(
                    Arg::with_name("role-arn")
                        .long("role-arn")
                        .takes_value(true)
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("ecr")
                .about("Container registry operations")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("login")
                        .about("Authenticate Docker against registries across regions")
                        .arg(
                            Arg::with_name("account-id")
                                .long("account-id")
                                .takes_value(true)
                                .required(true),
                        )
                        .arg(
                            Arg::with_name("regions")
                                .long("regions")
                                .takes_value(true)
                                .required(true)
                                .help("Comma-separated region list"),
                        )
                        .arg(
                            Arg::with_name("sequential")
                                .long("sequential")
                                .help("Walk regions one at a time instead of in parallel"),
                        ),
                )
                .subcommand(SubCommand::with_name("repos").about("List repositories"))
                .subcommand(
                    SubCommand::with_name("build-push")
                        .about("Build, tag and push an image through the staged pipeline")
                        .arg(
                            Arg::with_name("dockerfile")
                                .long("dockerfile")
                                .takes_value(true)
                                .required(true),
                        )
                        .arg(
                            Arg::with_name("context")
                                .long("context")
                                .takes_value(true)
                                .required(true),
                        )
                        .arg(
                            Arg::with_name("account-id")
                                .long("account-id")
                                .takes_value(true)
                                .required(true),
                        )
                        .arg(
                            Arg::with_name("repository")
                                .long("repository")
                                .takes_value(true)
                                .required(true),
                        )
                        .arg(
                            Arg::with_name("tag")
                                .long("tag")
                                .takes_value(true)
                                .default_value("latest"),
                        ),
                ),
        )
        .subcommand(
            SubCommand::with_name("eks")
                .about("Managed Kubernetes operations")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("clusters")
                        .about("List clusters")
                        .arg(
                            Arg::with_name("all-regions")
                                .long("all-regions")
                                .help("Walk the whole region catalog"),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("kubeconfig")
                        .about("Write a kubeconfig for a cluster")
                        .arg(
                            Arg::with_name("name")
                                .long("name")
                                .takes_value(true)
                                .required(true),
                        )
                        .arg(Arg::with_name("path").long("path").takes_value(true))
                        .arg(Arg::with_name("alias").long("alias").takes_value(true))
                        .arg(Arg::with_name("overwrite").long("overwrite"))
                        .arg(
                            Arg::with_name("default-location")
                                .long("default-location")
                                .conflicts_with("path")
                                .help("Merge into the CLI's standard kubeconfig"),
                        ),
                ),
        )
        .subcommand(
            SubCommand::with_name("stacks")
                .about("CloudFormation stack operations")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("list")
                        .about("List stacks across regions")
                        .arg(
                            Arg::with_name("regions")
                                .long("regions")
                                .takes_value(true)
                                .help("Comma-separated region list; defaults to the current region"),
                        )
                        .arg(Arg::with_name("apm-only").long("apm-only"))
                        .arg(
                            Arg::with_name("name-prefix")
                                .long("name-prefix")
                                .takes_value(true),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("show")
                        .about("Describe one stack with APM expansion")
                        .arg(
                            Arg::with_name("name")
                                .long("name")
                                .takes_value(true)
                                .required(true),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("drift")
                        .about("Detect drift and report per-resource differences")
                        .arg(
                            Arg::with_name("name")
                                .long("name")
                                .takes_value(true)
                                .required(true),
                        )
                        .arg(
                            Arg::with_name("timeout-seconds")
                                .long("timeout-seconds")
                                .takes_value(true)
                                .validator(u64_validator),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("health")
                        .about("Run resource health checks for a stack")
                        .arg(
                            Arg::with_name("name")
                                .long("name")
                                .takes_value(true)
                                .required(true),
                        ),
                ),
        )
        .subcommand(
            SubCommand::with_name("s3")
                .about("Object storage operations")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("create-bucket")
                        .arg(
                            Arg::with_name("name")
                                .long("name")
                                .takes_value(true)
                                .required(true),
                        )
                        .arg(
                            Arg::with_name("apm-lifecycle")
                                .long("apm-lifecycle")
                                .help("Apply the APM config lifecycle defaults"),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("upload")
                        .arg(
                            Arg::with_name("file")
                                .long("file")
                                .takes_value(true)
                                .required(true),
                        )
                        .arg(
                            Arg::with_name("bucket")
                                .long("bucket")
                                .takes_value(true)
                                .required(true),
                        )
                        .arg(
                            Arg::with_name("key")
                                .long("key")
                                .takes_value(true)
                                .required(true),
                        )
                        .arg(
                            Arg::with_name("multipart")
                                .long("multipart")
                                .help("Force the multipart path"),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("download")
                        .arg(
                            Arg::with_name("bucket")
                                .long("bucket")
                                .takes_value(true)
                                .required(true),
                        )
                        .arg(
                            Arg::with_name("key")
                                .long("key")
                                .takes_value(true)
                                .required(true),
                        )
                        .arg(
                            Arg::with_name("out")
                                .long("out")
                                .takes_value(true)
                                .required(true),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("delete-bucket")
                        .arg(
                            Arg::with_name("name")
                                .long("name")
                                .takes_value(true)
                                .required(true),
                        )
                        .arg(Arg::with_name("force").long("force")),
                ),
        )
        .subcommand(
            SubCommand::with_name("apm-config")
                .about("APM tool configuration in S3")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("upload")
                        .arg(apm_tool_arg())
                        .arg(env_arg())
                        .arg(bucket_arg())
                        .arg(
                            Arg::with_name("file")
                                .long("file")
                                .takes_value(true)
                                .required(true),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("download")
                        .arg(apm_tool_arg())
                        .arg(env_arg())
                        .arg(bucket_arg()),
                )
                .subcommand(
                    SubCommand::with_name("backup")
                        .arg(apm_tool_arg())
                        .arg(env_arg())
                        .arg(bucket_arg()),
                )
                .subcommand(
                    SubCommand::with_name("deploy")
                        .arg(apm_tool_arg())
                        .arg(bucket_arg())
                        .arg(
                            Arg::with_name("source-env")
                                .long("source-env")
                                .takes_value(true)
                                .required(true),
                        )
                        .arg(
                            Arg::with_name("target-env")
                                .long("target-env")
                                .takes_value(true)
                                .required(true),
                        ),
                ),
        )
        .subcommand(
            SubCommand::with_name("cloudwatch")
                .about("Observability operations")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("dashboard")
                        .arg(
                            Arg::with_name("name")
                                .long("name")
                                .takes_value(true)
                                .required(true),
                        )
                        .arg(
                            Arg::with_name("template")
                                .long("template")
                                .takes_value(true)
                                .required(true)
                                .validator(template_validator),
                        )
                        .arg(
                            Arg::with_name("namespace")
                                .long("namespace")
                                .takes_value(true)
                                .default_value("APM/Monitoring"),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("alarm-state").arg(
                        Arg::with_name("name")
                            .long("name")
                            .takes_value(true)
                            .required(true),
                    ),
                )
                .subcommand(
                    SubCommand::with_name("apm-setup").arg(apm_tool_arg()),
                )
                .subcommand(SubCommand::with_name("health")),
        )
        .get_matches();

    let (root_logger, _guard) = setup_logging(&LoggingConfiguration {
        force_json_output: matches.is_present("json-log"),
        version_string: crate_version!(),
        log_level: if matches.is_present("verbose") {
            "debug"
        } else {
            "info"
        },
    })?;

    // Keep the metrics runtime alive for the life of the process
    let _metrics_runtime = match matches.value_of("metrics-port") {
        Some(port) => Some(start_metrics_scrape_endpoint(
            port.parse::<u16>().map_err(|_| {
                Error::MissingArguments("metrics-port must be a valid port number")
            })?,
        )?),
        None => None,
    };

    let metrics = MetricsBundle::new()?;
    let kind = matches
        .value_of("provider")
        .map(ProviderKind::from_str)
        .transpose()
        .map_err(|_| Error::MissingArguments("provider"))?
        .unwrap_or(ProviderKind::Aws);
    let config = ProviderConfig {
        kind,
        region: matches.value_of("region").map(str::to_owned),
        profile: matches.value_of("profile").map(str::to_owned),
        ..Default::default()
    };
    let factory = ProviderFactory::new(&root_logger, &metrics);

    let trace_id = Uuid::new_v4();
    let logger = root_logger.new(o!("trace_id" => trace_id.to_string()));

    // Everything except the base capability set requires the AWS provider
    match matches.subcommand() {
        ("identity", Some(_)) => {
            let provider = factory.create_aws(config);
            let identity = provider.credentials_store().caller_identity()?;
            println!(
                "{}",
                serde_json::json!({
                    "account": identity.account,
                    "arn": identity.arn,
                    "userId": identity.user_id,
                })
            );
        }
        ("assume-role", Some(sub)) => {
            let provider = factory.create_aws(config);
            let options = AssumeRoleOptions {
                session_name: sub.value_of("session-name").map(str::to_owned),
                external_id: sub.value_of("external-id").map(str::to_owned),
                duration_seconds: sub
                    .value_of("duration-seconds")
                    .and_then(|value| value.parse().ok()),
                ..Default::default()
            };
            let credentials = provider
                .credentials_store()
                .assume_role_with_options(required(sub, "role-arn")?, &options)?;
            info!(
                logger, "assumed role";
                "account" => credentials.account_id.clone().unwrap_or_default(),
            );
            println!("{credentials:#?}");
        }
        ("accounts", Some(sub)) => {
            let provider = factory.create_aws(config);
            let location: ConfigLocation = required(sub, "config")?
                .parse()
                .map_err(Error::AnyhowError)?;
            let document = MultiAccountConfig::load(&location, provider.s3())?;
            println!("{} (master {})", document.organization, document.master_account);
            for account in &document.accounts {
                println!(
                    "{}\t{}\t{}\t{} role(s)",
                    account.account_id,
                    account.account_name,
                    account.environment,
                    account.roles.len()
                );
            }
        }
        ("validate-role", Some(sub)) => {
            let provider = factory.create_aws(config);
            let report = provider
                .credentials_store()
                .validate_role_assumption(required(sub, "role-arn")?)?;
            println!("{report:#?}");
        }
        ("ecr", Some(sub)) => run_ecr(&factory, config, sub, &logger)?,
        ("eks", Some(sub)) => run_eks(&factory, config, sub)?,
        ("stacks", Some(sub)) => run_stacks(&factory, config, sub)?,
        ("s3", Some(sub)) => run_s3(&factory, config, sub)?,
        ("apm-config", Some(sub)) => run_apm_config(&factory, config, sub, &logger)?,
        ("cloudwatch", Some(sub)) => run_cloudwatch(&factory, config, sub)?,
        _ => return Err(Error::MissingArguments("subcommand")),
    }

    Ok(())
}

fn apm_tool_arg() -> Arg<'static, 'static> {
    Arg::with_name("tool")
        .long("tool")
        .takes_value(true)
        .required(true)
        .validator(tool_validator)
}

fn env_arg() -> Arg<'static, 'static> {
    Arg::with_name("env")
        .long("env")
        .takes_value(true)
        .required(true)
}

fn bucket_arg() -> Arg<'static, 'static> {
    Arg::with_name("bucket")
        .long("bucket")
        .takes_value(true)
        .required(true)
}

fn run_ecr(
    factory: &ProviderFactory,
    config: ProviderConfig,
    matches: &ArgMatches,
    logger: &Logger,
) -> Result<(), Error> {
    let provider = factory.create_aws(config);
    match matches.subcommand() {
        ("login", Some(sub)) => {
            let mut options = EcrLoginOptions::new(
                required(sub, "account-id")?,
                comma_list(required(sub, "regions")?),
            );
            options.parallel = !sub.is_present("sequential");
            let report = provider.ecr().login_with_optimization(&options);
            info!(
                logger, "registry login finished";
                "success" => report.success,
            );
            println!("{report:#?}");
            if !report.success {
                std::process::exit(1);
            }
        }
        ("repos", Some(_)) => {
            let repositories = provider.ecr().list_repositories(&provider.current_region())?;
            for repository in repositories {
                println!("{}\t{}", repository.name, repository.uri);
            }
        }
        ("build-push", Some(sub)) => {
            let report = provider.ecr().build_and_push_image(&BuildPushOptions {
                dockerfile: PathBuf::from(required(sub, "dockerfile")?),
                context_dir: PathBuf::from(required(sub, "context")?),
                account_id: required(sub, "account-id")?.to_owned(),
                region: provider.current_region(),
                repository: required(sub, "repository")?.to_owned(),
                tag: sub.value_of("tag").unwrap_or("latest").to_owned(),
            });
            println!("{report:#?}");
            if !report.success {
                std::process::exit(1);
            }
        }
        _ => return Err(Error::MissingArguments("ecr subcommand")),
    }
    Ok(())
}

fn run_eks(
    factory: &ProviderFactory,
    config: ProviderConfig,
    matches: &ArgMatches,
) -> Result<(), Error> {
    let provider = factory.create_aws(config);
    match matches.subcommand() {
        ("clusters", Some(sub)) => {
            let clusters = if sub.is_present("all-regions") {
                let regions = provider.list_regions()?;
                provider.eks().list_clusters_all_regions(&regions)
            } else {
                provider.eks().list_clusters(&provider.current_region())?
            };
            for cluster in clusters {
                println!("{}\t{}\t{}", cluster.name, cluster.region, cluster.status);
            }
        }
        ("kubeconfig", Some(sub)) => {
            let options = KubeconfigOptions {
                overwrite: sub.is_present("overwrite"),
                alias: sub.value_of("alias").map(str::to_owned),
                kubeconfig_path: sub.value_of("path").map(PathBuf::from),
                use_default_location: sub.is_present("default-location"),
            };
            let result = provider.eks().setup_kubeconfig(
                required(sub, "name")?,
                &provider.current_region(),
                &options,
            )?;
            match (result.path, result.contents) {
                (Some(path), _) => println!("wrote kubeconfig to {}", path.display()),
                (None, Some(contents)) => print!("{contents}"),
                (None, None) => {}
            }
        }
        _ => return Err(Error::MissingArguments("eks subcommand")),
    }
    Ok(())
}

fn run_stacks(
    factory: &ProviderFactory,
    config: ProviderConfig,
    matches: &ArgMatches,
) -> Result<(), Error> {
    let provider = factory.create_aws(config);
    match matches.subcommand() {
        ("list", Some(sub)) => {
            let regions = sub
                .value_of("regions")
                .map(comma_list)
                .unwrap_or_else(|| vec![provider.current_region()]);
            let filters = StackFilters {
                regions,
                apm_only: sub.is_present("apm-only"),
                name_prefix: sub.value_of("name-prefix").map(str::to_owned),
                ..Default::default()
            };
            let stacks = provider.stacks().list_stacks(&filters)?;
            for stack in stacks {
                println!(
                    "{}\t{}\t{}\tapm={}",
                    stack.name, stack.region, stack.status, stack.is_apm_stack
                );
            }
        }
        ("show", Some(sub)) => {
            let stack = provider
                .stacks()
                .get_stack(required(sub, "name")?, &provider.current_region())?;
            println!("{stack:#?}");
        }
        ("drift", Some(sub)) => {
            let deadline = sub
                .value_of("timeout-seconds")
                .and_then(|value| value.parse::<u64>().ok())
                .map(|seconds| std::time::Instant::now() + Duration::from_secs(seconds));
            let result = provider.stacks().detect_drift(
                required(sub, "name")?,
                &provider.current_region(),
                deadline,
            )?;
            println!("{result:#?}");
        }
        ("health", Some(sub)) => {
            let stack = provider
                .stacks()
                .get_stack(required(sub, "name")?, &provider.current_region())?;
            let result = provider.stacks().check_stack_health(&stack);
            println!("{result:#?}");
        }
        _ => return Err(Error::MissingArguments("stacks subcommand")),
    }
    Ok(())
}

fn run_s3(
    factory: &ProviderFactory,
    config: ProviderConfig,
    matches: &ArgMatches,
) -> Result<(), Error> {
    let provider = factory.create_aws(config);
    match matches.subcommand() {
        ("create-bucket", Some(sub)) => {
            let mut options = BucketOptions::default();
            if sub.is_present("apm-lifecycle") {
                options.lifecycle_rules = Some(multicloud::s3::apm_lifecycle_rules());
            }
            provider.s3().create_bucket(
                required(sub, "name")?,
                &provider.current_region(),
                &options,
            )?;
            println!("created bucket {}", required(sub, "name")?);
        }
        ("upload", Some(sub)) => {
            let options = UploadOptions {
                multipart: sub.is_present("multipart"),
                ..Default::default()
            };
            let info = provider.s3().upload_file(
                &PathBuf::from(required(sub, "file")?),
                required(sub, "bucket")?,
                required(sub, "key")?,
                &options,
            )?;
            println!("{info:#?}");
        }
        ("download", Some(sub)) => {
            provider.s3().download_to(
                required(sub, "bucket")?,
                required(sub, "key")?,
                &PathBuf::from(required(sub, "out")?),
            )?;
            println!("downloaded to {}", required(sub, "out")?);
        }
        ("delete-bucket", Some(sub)) => {
            provider
                .s3()
                .delete_bucket(required(sub, "name")?, sub.is_present("force"))?;
            println!("deleted bucket {}", required(sub, "name")?);
        }
        _ => return Err(Error::MissingArguments("s3 subcommand")),
    }
    Ok(())
}

fn run_apm_config(
    factory: &ProviderFactory,
    config: ProviderConfig,
    matches: &ArgMatches,
    logger: &Logger,
) -> Result<(), Error> {
    let provider = factory.create_aws(config);
    let subcommand = matches.subcommand();
    let sub = subcommand
        .1
        .ok_or(Error::MissingArguments("apm-config subcommand"))?;
    let tool = ApmTool::from_str(required(sub, "tool")?)
        .map_err(|_| Error::MissingArguments("tool"))?;
    let store = ApmConfigStore::new(provider.s3().clone(), required(sub, "bucket")?, logger);

    match subcommand.0 {
        "upload" => {
            let file = std::fs::File::open(required(sub, "file")?)
                .map_err(|e| Error::AnyhowError(e.into()))?;
            let document = multicloud::parse_json_document(file)?;
            let key = store.upload_config(tool, required(sub, "env")?, &document)?;
            println!("uploaded {key}");
        }
        "download" => {
            let document = store.download_config(tool, required(sub, "env")?)?;
            println!("{}", serde_json::to_string_pretty(&document).unwrap_or_default());
        }
        "backup" => {
            let key = store.backup_config(tool, required(sub, "env")?)?;
            println!("backed up to {key}");
        }
        "deploy" => {
            let key = store.deploy_config(
                tool,
                required(sub, "source-env")?,
                required(sub, "target-env")?,
            )?;
            println!("deployed to {key}");
        }
        _ => return Err(Error::MissingArguments("apm-config subcommand")),
    }
    Ok(())
}

fn run_cloudwatch(
    factory: &ProviderFactory,
    config: ProviderConfig,
    matches: &ArgMatches,
) -> Result<(), Error> {
    let provider = factory.create_aws(config);
    match matches.subcommand() {
        ("dashboard", Some(sub)) => {
            let template = DashboardTemplate::from_str(required(sub, "template")?)
                .map_err(|_| Error::MissingArguments("template"))?;
            let dashboard = provider.cloudwatch().dashboards().create_dashboard(
                &DashboardConfig {
                    name: required(sub, "name")?.to_owned(),
                    template,
                    namespace: sub.value_of("namespace").unwrap_or("APM/Monitoring").to_owned(),
                },
            )?;
            println!("{dashboard:#?}");
        }
        ("alarm-state", Some(sub)) => {
            let state = provider
                .cloudwatch()
                .alarms()
                .get_alarm_state(required(sub, "name")?)?;
            println!("{state}");
        }
        ("apm-setup", Some(sub)) => {
            let tool = ApmTool::from_str(required(sub, "tool")?)
                .map_err(|_| Error::MissingArguments("tool"))?;
            let report = provider
                .cloudwatch()
                .apm_integrations()
                .setup_integration(tool)?;
            println!("{report:#?}");
        }
        ("health", Some(_)) => {
            let report = provider.cloudwatch().check_health();
            println!(
                "{} at {}",
                report.status,
                report.checked_at.format("%Y-%m-%dT%H:%M:%S%z")
            );
            for surface in &report.surfaces {
                println!(
                    "  {}: {}",
                    surface.name,
                    if surface.healthy { "ok" } else { "failed" }
                );
            }
        }
        _ => return Err(Error::MissingArguments("cloudwatch subcommand")),
    }
    Ok(())
}
