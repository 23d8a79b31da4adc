use figment::Figment;
use figment::providers::Env;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const DEFAULT_MINUTE_LIMIT: u32 = 10;
const DEFAULT_DAILY_LIMIT: u32 = 100;
const DEFAULT_TEMPERATURE_MIN: f64 = 0.5;
const DEFAULT_TEMPERATURE_MAX: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub api_key: String,
    pub base_url: String,
    pub timeout_ms: u64,
    pub proxy: String,

    pub minute_limit: u32,
    pub daily_limit: u32,

    pub temperature_min: f64,
    pub temperature_max: f64,

    pub debug: String,
}

/// 原始环境变量：一律按字符串读取，逐项解析，单个坏值不影响其它键。
#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(default, deserialize_with = "scalar", alias = "HOST")]
    host: Option<String>,
    #[serde(default, deserialize_with = "scalar", alias = "PORT")]
    port: Option<String>,

    #[serde(default, deserialize_with = "scalar", alias = "OPENAI_API_KEY")]
    openai_api_key: Option<String>,
    #[serde(default, deserialize_with = "scalar", alias = "OPENAI_BASE_URL")]
    openai_base_url: Option<String>,
    #[serde(default, deserialize_with = "scalar", alias = "TIMEOUT")]
    timeout: Option<String>,
    #[serde(default, deserialize_with = "scalar", alias = "PROXY")]
    proxy: Option<String>,

    #[serde(default, deserialize_with = "scalar", alias = "MINUTE_LIMIT")]
    minute_limit: Option<String>,
    #[serde(default, deserialize_with = "scalar", alias = "DAILY_LIMIT")]
    daily_limit: Option<String>,

    #[serde(default, deserialize_with = "scalar", alias = "TEMPERATURE_MIN")]
    temperature_min: Option<String>,
    #[serde(default, deserialize_with = "scalar", alias = "TEMPERATURE_MAX")]
    temperature_max: Option<String>,

    #[serde(default, deserialize_with = "scalar", alias = "DEBUG")]
    debug: Option<String>,
}

/// figment 会把 `1`、`true`、`0.5` 之类的值预先解析成数字/布尔，这里统一还原成字符串。
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Str(String),
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
}

fn scalar<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<Scalar>::deserialize(d)?.map(|v| match v {
        Scalar::Str(s) => s,
        Scalar::Bool(b) => b.to_string(),
        Scalar::Int(i) => i.to_string(),
        Scalar::UInt(u) => u.to_string(),
        Scalar::Float(f) => f.to_string(),
    }))
}

impl Config {
    pub fn load() -> Self {
        load_dotenv();

        let mut cfg = Self::from_env();

        // 命令行覆盖：-debug <level>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "-debug"
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        cfg
    }

    fn from_env() -> Self {
        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "读取环境变量配置失败，全部使用默认值");
                RawEnv::default()
            });
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawEnv) -> Self {
        let (temperature_min, temperature_max) = normalize_temperature_bounds(
            parse_opt("TEMPERATURE_MIN", raw.temperature_min.as_deref()),
            parse_opt("TEMPERATURE_MAX", raw.temperature_max.as_deref()),
        );

        Self {
            host: non_empty(raw.host).unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_or("PORT", raw.port.as_deref(), DEFAULT_PORT),
            api_key: raw.openai_api_key.unwrap_or_default().trim().to_string(),
            base_url: raw
                .openai_base_url
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            timeout_ms: parse_or("TIMEOUT", raw.timeout.as_deref(), DEFAULT_TIMEOUT_MS),
            proxy: raw.proxy.unwrap_or_default(),
            minute_limit: parse_or(
                "MINUTE_LIMIT",
                raw.minute_limit.as_deref(),
                DEFAULT_MINUTE_LIMIT,
            ),
            daily_limit: parse_or(
                "DAILY_LIMIT",
                raw.daily_limit.as_deref(),
                DEFAULT_DAILY_LIMIT,
            ),
            temperature_min,
            temperature_max,
            debug: non_empty(raw.debug).unwrap_or_else(|| "off".to_string()),
        }
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_raw(RawEnv::default())
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// 解析单个键；无法解析时告警并视为未设置。
fn parse_opt<T: FromStr>(key: &'static str, raw: Option<&str>) -> Option<T> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty())?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = raw, "配置值无法解析，使用默认值");
            None
        }
    }
}

fn parse_or<T: FromStr>(key: &'static str, raw: Option<&str>, default: T) -> T {
    parse_opt(key, raw).unwrap_or(default)
}

fn normalize_temperature_bounds(min: Option<f64>, max: Option<f64>) -> (f64, f64) {
    let min = min.unwrap_or(DEFAULT_TEMPERATURE_MIN);
    let max = max.unwrap_or(DEFAULT_TEMPERATURE_MAX);
    if !(min.is_finite() && max.is_finite()) || min > max {
        tracing::warn!(
            min,
            max,
            "TEMPERATURE_MIN/TEMPERATURE_MAX 配置无效，回退为默认区间"
        );
        return (DEFAULT_TEMPERATURE_MIN, DEFAULT_TEMPERATURE_MAX);
    }
    (min, max)
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(file) = std::fs::File::open(&dotenv_path) else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        // 已存在的进程环境变量优先，.env 只做补充。
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024：修改进程环境变量为 unsafe。这里仅在启动阶段、尚未创建任何线程时调用。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let parent = dir.parent()?;
        if parent == dir {
            return None;
        }
        dir = parent;
    }
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let raw = raw.trim();
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return Some((key.to_string(), raw[1..raw.len() - 1].to_string()));
        }
    }

    Some((key.to_string(), strip_inline_comment(raw).trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] != b'#' {
            continue;
        }
        if i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t' {
            return value[..i].trim_end();
        }
    }
    value
}
