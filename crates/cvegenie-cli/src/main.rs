//! CVE-Genie planning CLI
//!
//! The `cvegenie` command drives the planner kernel without running any
//! capability.
//!
//! ## Commands
//!
//! - `classify`: CVE record -> classifier decision
//! - `plan`: decision (or record) -> execution plan
//! - `validate`: check a persisted plan
//! - `analyze-failure`: diagnose an error message or HTTP status
//! - `record-run`: append a result to the shared `results.csv` ledger

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cvegenie_bus::{FsResultBus, ResultBus, RunRecord};
use cvegenie_core::telemetry::init_tracing;
use cvegenie_core::{
    Classifier, ClassifierDecision, ExecutionPlan, FailureAnalyzer, FailureDetail, GenieConfig,
    PlanIssue, RuleBasedClassifier,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "cvegenie")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CVE-Genie planner: classify, plan and validate CVE reproductions", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true, env = "CVEGENIE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true, env = "CVEGENIE_JSON_LOGS")]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true, env = "CVEGENIE_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a CVE record into a profile
    Classify {
        #[command(flatten)]
        record: RecordArgs,

        /// Write the decision here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Build the execution plan for a decision or a raw record
    Plan {
        /// Classifier decision JSON (as written by `classify`)
        #[arg(long, conflicts_with_all = ["cve_id", "record", "profile"])]
        decision: Option<PathBuf>,

        #[command(flatten)]
        record: OptionalRecordArgs,

        /// Directory or file of YAML plan templates
        #[arg(long, env = "CVEGENIE_TEMPLATE_DIR")]
        templates: Option<PathBuf>,

        /// Save the plan here instead of printing it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check a persisted plan; fails when the executor would reject it
    Validate {
        /// Plan JSON file
        plan: PathBuf,

        /// Print issues as JSON
        #[arg(long)]
        json: bool,
    },

    /// Classify a failure message or HTTP status code
    AnalyzeFailure {
        /// Error message to classify
        #[arg(required_unless_present = "http_code")]
        message: Option<String>,

        /// HTTP status observed while probing the target
        #[arg(long, conflicts_with = "message")]
        http_code: Option<u16>,
    },

    /// Append a run result to the shared results ledger
    RecordRun {
        /// CVE identifier
        #[arg(long)]
        cve_id: String,

        /// Result JSON (`success`, `reason`, `cost`, `time`, `model`)
        #[arg(long)]
        result: PathBuf,

        /// Shared root holding `results.csv`; overrides the config file
        #[arg(long, env = "CVEGENIE_SHARED_ROOT")]
        shared_root: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RecordArgs {
    /// CVE identifier
    #[arg(long)]
    cve_id: String,

    /// CVE record JSON (`description`, `cwe`, ...)
    #[arg(long)]
    record: PathBuf,

    /// Skip heuristics and use this profile
    #[arg(long)]
    profile: Option<String>,
}

#[derive(Args)]
struct OptionalRecordArgs {
    /// CVE identifier
    #[arg(long, requires = "record")]
    cve_id: Option<String>,

    /// CVE record JSON
    #[arg(long, requires = "cve_id")]
    record: Option<PathBuf>,

    /// Skip heuristics and use this profile
    #[arg(long)]
    profile: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = GenieConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    let level = config.log_level().context("Invalid log level")?;
    init_tracing(cli.json_logs || config.logging.json, level);
    debug!(config = ?cli.config, "configuration loaded");

    match cli.command {
        Commands::Classify { record, output } => cmd_classify(&config, &record, output.as_deref()),
        Commands::Plan {
            decision,
            record,
            templates,
            output,
        } => {
            if let Some(dir) = templates {
                config.template_dir = Some(dir);
            }
            cmd_plan(&config, decision.as_deref(), &record, output.as_deref())
        }
        Commands::Validate { plan, json } => cmd_validate(&plan, json),
        Commands::AnalyzeFailure { message, http_code } => {
            cmd_analyze_failure(message.as_deref(), http_code)
        }
        Commands::RecordRun {
            cve_id,
            result,
            shared_root,
        } => {
            if let Some(root) = shared_root {
                config.shared_root = root;
            }
            cmd_record_run(&config, &cve_id, &result)
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_json(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {:?}", path))
}

fn emit_json<T: Serialize>(value: &T, output: Option<&Path>) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("Failed to write {:?}", path))?;
            println!("Wrote {:?}", path);
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

fn classify_record(
    config: &GenieConfig,
    cve_id: &str,
    record_path: &Path,
    profile: Option<&str>,
) -> Result<ClassifierDecision> {
    let record = read_json(record_path)?;
    let classifier = RuleBasedClassifier::new(config.classifier.clone());
    Ok(classifier.classify(cve_id, &record, profile))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_classify(config: &GenieConfig, args: &RecordArgs, output: Option<&Path>) -> Result<()> {
    let decision = classify_record(config, &args.cve_id, &args.record, args.profile.as_deref())?;
    info!(
        cve_id = %decision.cve_id,
        profile = %decision.profile,
        confidence = decision.confidence,
        "classified"
    );
    emit_json(&decision, output)
}

fn build_plan(
    config: &GenieConfig,
    decision_path: Option<&Path>,
    record: &OptionalRecordArgs,
) -> Result<ExecutionPlan> {
    let decision = match (decision_path, &record.cve_id, &record.record) {
        (Some(path), _, _) => serde_json::from_value::<ClassifierDecision>(read_json(path)?)
            .with_context(|| format!("Invalid classifier decision in {:?}", path))?,
        (None, Some(cve_id), Some(record_path)) => {
            classify_record(config, cve_id, record_path, record.profile.as_deref())?
        }
        _ => anyhow::bail!("Either --decision or both --cve-id and --record are required"),
    };

    let source = config.plan_source().context("Failed to open plan templates")?;
    let plan = source
        .plan_for(&decision)
        .with_context(|| format!("No plan for profile {}", decision.profile))?;
    Ok(plan)
}

fn cmd_plan(
    config: &GenieConfig,
    decision_path: Option<&Path>,
    record: &OptionalRecordArgs,
    output: Option<&Path>,
) -> Result<()> {
    let plan = build_plan(config, decision_path, record)?;
    let digest = plan.digest()?;
    info!(
        cve_id = %plan.cve_id,
        profile = %plan.profile,
        steps = plan.steps.len(),
        digest = %digest,
        "plan built"
    );

    match output {
        Some(path) => {
            plan.save(path)
                .with_context(|| format!("Failed to save plan to {:?}", path))?;
            println!("Saved plan {} ({} steps) to {:?}", &digest[..12], plan.steps.len(), path);
        }
        None => println!("{}", plan.to_json_pretty()?),
    }
    Ok(())
}

fn validate_plan(path: &Path) -> Result<Vec<PlanIssue>> {
    let plan = ExecutionPlan::load(path)
        .with_context(|| format!("Failed to load plan {:?}", path))?;
    Ok(plan.validate())
}

fn cmd_validate(path: &Path, json: bool) -> Result<()> {
    let issues = validate_plan(path)?;
    let fatal = issues.iter().filter(|i| i.is_fatal()).count();

    if json {
        println!("{}", serde_json::to_string_pretty(&issues)?);
    } else if issues.is_empty() {
        println!("{:?}: no issues", path);
    } else {
        for issue in &issues {
            let marker = if issue.is_fatal() { "error" } else { "warning" };
            println!("{}: {}", marker, issue);
        }
    }

    if fatal > 0 {
        anyhow::bail!("Plan has {} fatal issue(s)", fatal);
    }
    Ok(())
}

fn analyze_failure(message: Option<&str>, http_code: Option<u16>) -> Result<FailureDetail> {
    match (message, http_code) {
        (_, Some(code)) => Ok(FailureAnalyzer::from_http_code(code)),
        (Some(message), None) => Ok(FailureAnalyzer::analyze(message)),
        (None, None) => anyhow::bail!("A message or --http-code is required"),
    }
}

fn cmd_analyze_failure(message: Option<&str>, http_code: Option<u16>) -> Result<()> {
    let detail = analyze_failure(message, http_code)?;
    emit_json(&detail, None)
}

fn cmd_record_run(config: &GenieConfig, cve_id: &str, result_path: &Path) -> Result<()> {
    let result = read_json(result_path)?;
    let record = RunRecord::from_result(&result, &config.model);
    let bus = FsResultBus::new(cve_id, &config.shared_root)
        .with_context(|| format!("Failed to open shared root {:?}", config.shared_root))?;
    bus.record_run(&record)?;
    println!(
        "{} {} ({}) -> {:?}",
        cve_id,
        if record.success { "SUCCESS" } else { "FAILED" },
        record.reason,
        bus.results_path()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use cvegenie_core::{FailureCode, Profile};
    use serde_json::json;

    fn write_json(dir: &Path, name: &str, value: &Value) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, value.to_string()).unwrap();
        path
    }

    fn no_record() -> OptionalRecordArgs {
        OptionalRecordArgs {
            cve_id: None,
            record: None,
            profile: None,
        }
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "cvegenie",
            "validate",
            "plan.json",
            "--log-level",
            "debug",
            "--json-logs",
        ])
        .unwrap();
        assert!(cli.json_logs);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Commands::Validate { json: false, .. }));
    }

    #[test]
    fn test_plan_rejects_decision_with_record() {
        let parsed = Cli::try_parse_from([
            "cvegenie",
            "plan",
            "--decision",
            "d.json",
            "--cve-id",
            "CVE-2024-0001",
            "--record",
            "r.json",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_analyze_failure_requires_input() {
        assert!(Cli::try_parse_from(["cvegenie", "analyze-failure"]).is_err());
        assert!(Cli::try_parse_from(["cvegenie", "analyze-failure", "--http-code", "429"]).is_ok());
    }

    #[test]
    fn test_classify_then_plan_from_decision() {
        let dir = tempfile::tempdir().unwrap();
        let record = write_json(
            dir.path(),
            "record.json",
            &json!({"description": "Stored XSS in comments", "cwe": [{"id": "CWE-79"}]}),
        );
        let config = GenieConfig::default();

        let decision = classify_record(&config, "CVE-2024-0001", &record, None).unwrap();
        assert_eq!(decision.profile, Profile::WebBasic);

        let decision_path = write_json(
            dir.path(),
            "decision.json",
            &serde_json::to_value(&decision).unwrap(),
        );
        let plan = build_plan(&config, Some(&decision_path), &no_record()).unwrap();
        assert_eq!(plan.cve_id, "CVE-2024-0001");
        assert_eq!(plan.steps.len(), 7);

        let plan_path = dir.path().join("plan.json");
        cmd_plan(&config, Some(&decision_path), &no_record(), Some(&plan_path)).unwrap();
        assert!(validate_plan(&plan_path).unwrap().is_empty());
        assert!(cmd_validate(&plan_path, false).is_ok());
    }

    #[test]
    fn test_plan_from_record_with_profile_override() {
        let dir = tempfile::tempdir().unwrap();
        let record = write_json(dir.path(), "record.json", &json!({"description": "xss"}));
        let args = OptionalRecordArgs {
            cve_id: Some("CVE-2024-0002".into()),
            record: Some(record),
            profile: Some("iot-firmware".into()),
        };
        let plan = build_plan(&GenieConfig::default(), None, &args).unwrap();
        assert_eq!(plan.profile, Profile::IotFirmware);
        assert!(build_plan(&GenieConfig::default(), None, &no_record()).is_err());
    }

    #[test]
    fn test_plan_with_missing_template_fails() {
        let dir = tempfile::tempdir().unwrap();
        let record = write_json(dir.path(), "record.json", &json!({}));
        let config = GenieConfig {
            template_dir: Some(dir.path().to_path_buf()),
            ..GenieConfig::default()
        };
        let args = OptionalRecordArgs {
            cve_id: Some("CVE-2024-0003".into()),
            record: Some(record),
            profile: None,
        };
        let err = build_plan(&config, None, &args).unwrap_err();
        assert!(format!("{:#}", err).contains("native-local"));
    }

    #[test]
    fn test_validate_fails_on_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let plan = write_json(
            dir.path(),
            "plan.json",
            &json!({
                "cve_id": "CVE-2024-0004",
                "profile": "native-local",
                "steps": [
                    {"id": "a", "capability": "C", "implementation": "I", "requires": ["b"]},
                    {"id": "b", "capability": "C", "implementation": "I", "requires": ["a"]}
                ]
            }),
        );
        let issues = validate_plan(&plan).unwrap();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].is_fatal());
        assert!(cmd_validate(&plan, true).is_err());
    }

    #[test]
    fn test_analyze_failure_prefers_http_code() {
        let detail = analyze_failure(Some("npm ERR! ERESOLVE"), None).unwrap();
        assert_eq!(detail.failure_code, FailureCode::NpmPeerConflict);

        let detail = analyze_failure(None, Some(504)).unwrap();
        assert_eq!(detail.failure_code, FailureCode::NetworkTimeout);
        assert!(detail.recoverable);

        assert!(analyze_failure(None, None).is_err());
    }

    #[test]
    fn test_record_run_appends_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let result = write_json(
            dir.path(),
            "result.json",
            &json!({"success": "True", "reason": "flag captured", "cost": "0.8", "time": 42}),
        );
        let config = GenieConfig {
            shared_root: dir.path().join("shared"),
            model: "gpt-4o".into(),
            ..GenieConfig::default()
        };

        cmd_record_run(&config, "CVE-2024-0005", &result).unwrap();
        let ledger = std::fs::read_to_string(dir.path().join("shared").join("results.csv")).unwrap();
        let lines: Vec<&str> = ledger.lines().collect();
        assert_eq!(lines[0], "CVE,SUCCESS,REASON,COST,TIME,MODEL");
        assert!(lines[1].starts_with("CVE-2024-0005,True,flag captured,0.8,42"));
        assert!(lines[1].ends_with(",gpt-4o"));
    }
}
