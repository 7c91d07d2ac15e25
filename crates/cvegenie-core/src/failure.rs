//! Failure taxonomy and message-driven diagnosis.
//!
//! Every error leaving the executor is tagged with a [`FailureDetail`]. The
//! tag is advisory: it is matched from the error text against an ordered
//! pattern table and never changes control flow.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

macro_rules! failure_codes {
    ($($variant:ident => $code:literal, $name:literal;)*) => {
        /// Closed set of failure codes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(into = "String", try_from = "String")]
        pub enum FailureCode {
            $($variant,)*
        }

        impl FailureCode {
            pub const ALL: &'static [FailureCode] = &[$(FailureCode::$variant,)*];

            /// Short code such as `E001`.
            pub fn code(self) -> &'static str {
                match self {
                    $(FailureCode::$variant => $code,)*
                }
            }

            /// Upper-snake name such as `VERSION_MISMATCH`.
            pub fn name(self) -> &'static str {
                match self {
                    $(FailureCode::$variant => $name,)*
                }
            }
        }
    };
}

failure_codes! {
    VersionMismatch => "E001", "VERSION_MISMATCH";
    DepsMissing => "E002", "DEPS_MISSING";
    ServiceNotRunning => "E003", "SERVICE_NOT_RUNNING";
    ConfigError => "E004", "CONFIG_ERROR";
    BuildFailed => "E005", "BUILD_FAILED";
    PortConflict => "E006", "PORT_CONFLICT";
    PermissionDenied => "E007", "PERMISSION_DENIED";
    ResourceExhausted => "E008", "RESOURCE_EXHAUSTED";
    DockerError => "E009", "DOCKER_ERROR";
    GitCloneFailed => "E010", "GIT_CLONE_FAILED";
    CheckoutFailed => "E011", "CHECKOUT_FAILED";
    InstallFailed => "E012", "INSTALL_FAILED";
    StartTimeout => "E013", "START_TIMEOUT";
    HealthCheckFailed => "E014", "HEALTH_CHECK_FAILED";
    EnvNotFound => "E015", "ENV_NOT_FOUND";
    NpmPeerConflict => "E016", "NPM_PEER_CONFLICT";
    NodeVersionMismatch => "E017", "NODE_VERSION_MISMATCH";

    PayloadRejected => "T001", "PAYLOAD_REJECTED";
    PathUnreachable => "T002", "PATH_UNREACHABLE";
    AuthRequired => "T003", "AUTH_REQUIRED";
    EndpointNotFound => "T004", "ENDPOINT_NOT_FOUND";
    MethodNotAllowed => "T005", "METHOD_NOT_ALLOWED";
    ParamValidation => "T006", "PARAM_VALIDATION";
    WafBlocked => "T007", "WAF_BLOCKED";
    RateLimited => "T008", "RATE_LIMITED";
    PatchApplied => "T009", "PATCH_APPLIED";
    VulnNotTriggered => "T010", "VULN_NOT_TRIGGERED";
    PreconditionFailed => "T011", "PRECONDITION_FAILED";
    SessionInvalid => "T012", "SESSION_INVALID";

    NoEvidence => "V001", "NO_EVIDENCE";
    FalsePositive => "V002", "FALSE_POSITIVE";
    OracleFailed => "V003", "ORACLE_FAILED";
    CanaryNotFound => "V004", "CANARY_NOT_FOUND";
    UnexpectedResponse => "V005", "UNEXPECTED_RESPONSE";
    PartialSuccess => "V006", "PARTIAL_SUCCESS";
    VerificationTimeout => "V007", "TIMEOUT";
    SideEffectMissing => "V008", "SIDE_EFFECT_MISSING";

    CveInfoIncomplete => "D001", "CVE_INFO_INCOMPLETE";
    NoPoc => "D002", "NO_POC";
    InvalidRepoUrl => "D003", "INVALID_REPO_URL";
    VersionNotFound => "D004", "VERSION_NOT_FOUND";
    NoDeployStrategy => "D005", "NO_DEPLOY_STRATEGY";
    UnsupportedLanguage => "D006", "UNSUPPORTED_LANG";
    HardwareVuln => "D007", "HARDWARE_VULN";
    ClosedSource => "D008", "CLOSED_SOURCE";

    ConnectionRefused => "N001", "CONNECTION_REFUSED";
    DnsFailed => "N002", "DNS_FAILED";
    NetworkTimeout => "N003", "TIMEOUT";
    SslError => "N004", "SSL_ERROR";
    ProxyError => "N005", "PROXY_ERROR";

    Unknown => "U001", "UNKNOWN";
    LlmError => "U002", "LLM_ERROR";
    InternalError => "U003", "INTERNAL_ERROR";
}

impl FailureCode {
    pub fn category(self) -> FailureCategory {
        match self.code().as_bytes()[0] {
            b'E' => FailureCategory::Environment,
            b'T' => FailureCategory::Trigger,
            b'V' => FailureCategory::Verification,
            b'D' => FailureCategory::Data,
            b'N' => FailureCategory::Network,
            _ => FailureCategory::Unknown,
        }
    }

    /// `E001_VERSION_MISMATCH` style label.
    pub fn label(self) -> String {
        format!("{}_{}", self.code(), self.name())
    }

    /// Whether an automated retry or fix is plausible for this code.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            FailureCode::DepsMissing
                | FailureCode::ServiceNotRunning
                | FailureCode::PortConflict
                | FailureCode::InstallFailed
                | FailureCode::StartTimeout
                | FailureCode::NpmPeerConflict
                | FailureCode::NodeVersionMismatch
                | FailureCode::PayloadRejected
                | FailureCode::AuthRequired
                | FailureCode::NetworkTimeout
        )
    }

    pub fn suggested_action(self) -> Option<&'static str> {
        let action = match self {
            FailureCode::VersionMismatch => {
                "check the affected versions in the CVE record and check out the matching git tag"
            }
            FailureCode::DepsMissing => {
                "run the dependency install command (pip install, npm install, composer install)"
            }
            FailureCode::ServiceNotRunning => {
                "check the service start command and its logs for the startup failure"
            }
            FailureCode::ConfigError => {
                "check configuration files and make sure required environment variables are set"
            }
            FailureCode::GitCloneFailed => "check the repository URL and network reachability",
            FailureCode::CheckoutFailed => {
                "check that the version tag exists; list candidates with git tag -l"
            }
            FailureCode::InstallFailed => {
                "check dependency version compatibility; pin specific versions if needed"
            }
            FailureCode::HealthCheckFailed => {
                "wait longer before probing and confirm the real state in the service logs"
            }
            FailureCode::NpmPeerConflict => {
                "retry with npm install --legacy-peer-deps or npm install --force"
            }
            FailureCode::NodeVersionMismatch => {
                "switch to the Node.js version the project requires (e.g. with nvm)"
            }
            FailureCode::PayloadRejected => "adjust the payload format, encoding or filter bypass",
            FailureCode::AuthRequired => "provide valid credentials or target the auth bypass",
            FailureCode::PatchApplied => "make sure the vulnerable version is deployed, not the fix",
            FailureCode::NoEvidence => "use a more sensitive verification strategy",
            FailureCode::CveInfoIncomplete => {
                "gather more detail from NVD, GitHub advisories or vendor bulletins"
            }
            FailureCode::NoPoc => "search for a public PoC or derive one from the patch",
            _ => return None,
        };
        Some(action)
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl From<FailureCode> for String {
    fn from(code: FailureCode) -> Self {
        code.code().to_string()
    }
}

impl TryFrom<String> for FailureCode {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        FailureCode::ALL
            .iter()
            .copied()
            .find(|c| c.code() == s || c.label() == s)
            .ok_or_else(|| format!("unknown failure code {s}"))
    }
}

/// Coarse grouping of failure codes by their leading letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCategory {
    #[serde(rename = "E")]
    Environment,
    #[serde(rename = "T")]
    Trigger,
    #[serde(rename = "V")]
    Verification,
    #[serde(rename = "D")]
    Data,
    #[serde(rename = "N")]
    Network,
    #[serde(rename = "U")]
    Unknown,
}

/// Diagnosis attached to a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub failure_code: FailureCode,
    pub category: FailureCategory,
    pub message: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub recoverable: bool,
    pub suggested_action: Option<String>,
}

impl FailureDetail {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            failure_code: code,
            category: code.category(),
            message: message.into(),
            context: Map::new(),
            recoverable: code.is_recoverable(),
            suggested_action: code.suggested_action().map(str::to_string),
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context.extend(context);
        self
    }
}

/// Ordered message patterns; the first match wins.
const PATTERNS: &[(&str, FailureCode)] = &[
    (r"version.*mismatch|版本.*不匹配", FailureCode::VersionMismatch),
    (r"module.*not found|import.*error|依赖.*缺失|no module named", FailureCode::DepsMissing),
    (r"connection refused|econnrefused|服务.*未.*运行", FailureCode::ServiceNotRunning),
    (r"config.*error|配置.*错误", FailureCode::ConfigError),
    (r"build.*fail|编译.*失败|make.*error", FailureCode::BuildFailed),
    (r"address.*in use|端口.*占用|eaddrinuse", FailureCode::PortConflict),
    (r"permission denied|权限.*拒绝|eacces", FailureCode::PermissionDenied),
    (r"out of memory|资源.*耗尽|no space", FailureCode::ResourceExhausted),
    (r"docker.*error|container.*fail", FailureCode::DockerError),
    (r"git.*clone.*fail|clone.*error", FailureCode::GitCloneFailed),
    (r"checkout.*fail|git.*checkout.*error", FailureCode::CheckoutFailed),
    (
        r"npm.*install.*fail|pip.*install.*fail|composer.*install.*fail",
        FailureCode::InstallFailed,
    ),
    (
        r"eresolve|peer.*dep|could not resolve dependency|conflicting peer",
        FailureCode::NpmPeerConflict,
    ),
    (
        r"engine.*incompatible|unsupported.*engine|requires.*node",
        FailureCode::NodeVersionMismatch,
    ),
    (r"startup.*timeout|启动.*超时|start.*timeout", FailureCode::StartTimeout),
    (r"health.*check.*fail|healthy.*false", FailureCode::HealthCheckFailed),
    (r"403|forbidden|payload.*reject", FailureCode::PayloadRejected),
    (r"404|not found|路径.*不存在", FailureCode::PathUnreachable),
    (r"401|unauthorized|认证.*失败|auth.*require", FailureCode::AuthRequired),
    (r"endpoint.*not.*exist", FailureCode::EndpointNotFound),
    (r"405|method.*not.*allow", FailureCode::MethodNotAllowed),
    (r"400|bad.*request|参数.*错误", FailureCode::ParamValidation),
    (r"waf|firewall|blocked", FailureCode::WafBlocked),
    (r"429|rate.*limit|too.*many", FailureCode::RateLimited),
    (r"patch.*applied|已.*修复|fixed", FailureCode::PatchApplied),
    (r"no.*evidence|无.*证据", FailureCode::NoEvidence),
    (r"false.*positive|误报", FailureCode::FalsePositive),
    (r"canary.*not.*found|金丝雀.*未找到", FailureCode::CanaryNotFound),
    (r"unexpected.*response|响应.*不符", FailureCode::UnexpectedResponse),
    (r"cve.*info.*incomplete|信息.*不完整", FailureCode::CveInfoIncomplete),
    (r"no.*poc|无.*poc", FailureCode::NoPoc),
    (r"invalid.*url|url.*invalid", FailureCode::InvalidRepoUrl),
    (r"version.*not.*found|版本.*找不到", FailureCode::VersionNotFound),
    (r"hardware|硬件", FailureCode::HardwareVuln),
    (r"connection.*timeout|网络.*超时", FailureCode::NetworkTimeout),
    (r"ssl.*error|certificate", FailureCode::SslError),
];

fn compiled_patterns() -> &'static [(Regex, FailureCode)] {
    static COMPILED: OnceLock<Vec<(Regex, FailureCode)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        PATTERNS
            .iter()
            .filter_map(|(pattern, code)| {
                Regex::new(&format!("(?i){pattern}"))
                    .ok()
                    .map(|re| (re, *code))
            })
            .collect()
    })
}

/// Maps error messages and HTTP status codes to [`FailureDetail`]s.
pub struct FailureAnalyzer;

impl FailureAnalyzer {
    /// Classify an error message; unmatched messages map to `U001`.
    pub fn analyze(message: &str) -> FailureDetail {
        let code = compiled_patterns()
            .iter()
            .find(|(re, _)| re.is_match(message))
            .map(|(_, code)| *code)
            .unwrap_or(FailureCode::Unknown);
        FailureDetail::new(code, message)
    }

    pub fn analyze_with_context(message: &str, context: Map<String, Value>) -> FailureDetail {
        Self::analyze(message).with_context(context)
    }

    /// Classify an HTTP status observed while probing a target.
    pub fn from_http_code(http_code: u16) -> FailureDetail {
        let code = match http_code {
            0 | 502 | 503 => FailureCode::ServiceNotRunning,
            400 => FailureCode::ParamValidation,
            401 => FailureCode::AuthRequired,
            403 => FailureCode::PayloadRejected,
            404 => FailureCode::PathUnreachable,
            405 => FailureCode::MethodNotAllowed,
            429 => FailureCode::RateLimited,
            500 => FailureCode::InternalError,
            504 => FailureCode::NetworkTimeout,
            _ => FailureCode::Unknown,
        };
        let mut context = Map::new();
        context.insert("http_code".into(), Value::from(http_code));

        let mut detail = FailureDetail::new(code, format!("HTTP {http_code}")).with_context(context);
        detail.recoverable = matches!(http_code, 429 | 502 | 503 | 504);
        detail
    }
}
