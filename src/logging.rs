use axum::http::HeaderMap;
use sonic_rs::prelude::*;
use std::time::Duration;

/// 详细日志等级：
/// - off：不输出客户端/上游的请求响应块
/// - low：输出客户端请求/响应（格式化）
/// - medium：输出客户端 + 上游请求/响应（格式化，鉴权头脱敏）
/// - high：输出客户端 + 上游请求/响应（完全原始；流式逐行输出）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" | "upstream" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn upstream_enabled(self) -> bool {
        self >= Self::Medium
    }

    /// 是否启用“完全原始”日志（high）。
    pub fn raw_enabled(self) -> bool {
        self >= Self::High
    }
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub fn client_request(level: LogLevel, method: &str, path: &str, body: &[u8]) {
    let body = if level.raw_enabled() {
        format_bytes_raw(body)
    } else {
        format_body_bytes(body)
    };
    tracing::info!(
        "\n===================== 客户端请求 ======================\n[客户端请求] {method} {path}\n{body}\n========================================================="
    );
}

pub fn client_response(level: LogLevel, status: u16, duration: Duration, body: &[u8]) {
    let body = if level.raw_enabled() {
        format_bytes_raw(body)
    } else {
        format_body_bytes(body)
    };
    tracing::info!(
        "\n===================== 客户端响应 ======================\n[客户端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        body
    );
}

pub fn client_stream_response(status: u16, duration: Duration, chunks: usize, error: Option<&str>) {
    tracing::info!(
        "\n=================== 客户端流式响应 =======================\n[客户端流式] {} {}ms 转发 {} 个分片{}\n==========================================================",
        status,
        format_duration_ms(duration),
        chunks,
        error.map(|e| format!("，终止错误: {e}")).unwrap_or_default()
    );
}

pub fn upstream_request(level: LogLevel, url: &str, headers: &HeaderMap, body: &[u8]) {
    let (headers, body) = if level.raw_enabled() {
        (format_headers_raw(headers), format_bytes_raw(body))
    } else {
        (format_headers(headers), format_body_bytes(body))
    };
    tracing::info!(
        "\n====================== 上游请求 ========================\n[上游请求] POST {url}\n[上游请求头]\n{headers}\n{body}\n=========================================================="
    );
}

pub fn upstream_response(level: LogLevel, status: u16, duration: Duration, body: &[u8]) {
    let body = if level.raw_enabled() {
        format_bytes_raw(body)
    } else {
        format_body_bytes(body)
    };
    tracing::info!(
        "\n====================== 上游响应 ========================\n[上游响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        body
    );
}

pub fn upstream_stream_line_raw(line: &[u8]) {
    // 不做任何 JSON 解析/格式化；非 UTF-8 时降级为 lossy。
    tracing::info!("{}", String::from_utf8_lossy(line));
}

fn format_headers(headers: &HeaderMap) -> String {
    let mut obj = sonic_rs::Object::new();

    for (name, value) in headers.iter() {
        let key = name.as_str();
        let key_lc = key.to_lowercase();

        let v = if key_lc == "authorization" || key_lc == "proxy-authorization" {
            sonic_rs::Value::from("Bearer ***")
        } else {
            match value.to_str() {
                Ok(s) => sonic_rs::Value::from(s),
                Err(_) => sonic_rs::Value::from("<binary>"),
            }
        };
        obj.insert(key, v);
    }

    format_body_value(&obj.into_value())
}

fn format_headers_raw(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers.iter() {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(value.to_str().unwrap_or("<non-utf8>"));
        out.push('\n');
    }
    out
}

fn format_body_value(v: &sonic_rs::Value) -> String {
    let shortened = shorten_strings_for_log(v);
    match sonic_rs::to_string_pretty(&shortened) {
        Ok(s) => s,
        Err(_) => shortened.to_string(),
    }
}

fn format_body_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    // 超大包不做 JSON 解析，避免日志本身成为瓶颈。
    const MAX_PARSE_BYTES: usize = 2 * 1024 * 1024;
    if bytes.len() > MAX_PARSE_BYTES {
        return format!(
            "(body too large: {} bytes)\n{}",
            bytes.len(),
            truncate_text_for_log(&String::from_utf8_lossy(&bytes[..MAX_PARSE_BYTES / 64]))
        );
    }

    match sonic_rs::from_slice::<sonic_rs::Value>(bytes) {
        Ok(v) => format_body_value(&v),
        Err(_) => truncate_text_for_log(&String::from_utf8_lossy(bytes)),
    }
}

fn format_bytes_raw(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn truncate_text_for_log(s: &str) -> String {
    const MAX_CHARS: usize = 32 * 1024;
    truncate_chars(s, MAX_CHARS)
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_string(),
        Some((idx, _)) => {
            let omitted = s[idx..].chars().count();
            format!("{}...[TRUNCATED: {omitted} chars]", &s[..idx])
        }
    }
}

/// 单条消息最多 10000 字符、最多 50 条；格式化日志时只保留每个字符串的开头。
fn shorten_strings_for_log(v: &sonic_rs::Value) -> sonic_rs::Value {
    const MAX_STRING_CHARS: usize = 2_000;

    if let Some(obj) = v.as_object() {
        let mut out = sonic_rs::Object::new();
        for (key, child) in obj.iter() {
            out.insert(key, shorten_strings_for_log(child));
        }
        return out.into_value();
    }

    if let Some(arr) = v.as_array() {
        let items: Vec<sonic_rs::Value> = arr.iter().map(shorten_strings_for_log).collect();
        return sonic_rs::Value::from(items);
    }

    if let Some(s) = v.as_str() {
        return sonic_rs::Value::from(truncate_chars(s, MAX_STRING_CHARS).as_str());
    }

    v.to_owned()
}
