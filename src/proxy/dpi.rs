//! 明文 HTTP 请求头整形：按浏览器模板重排并补齐请求头

use tracing::trace;

use crate::config::types::DpiConfig;
use crate::proxy::sniff::{find_subslice, is_http_request};

/// 浏览器请求头模板：顺序即输出顺序
#[derive(Debug, Clone)]
pub struct HeaderTemplate {
    pub name: &'static str,
    pub headers: Vec<(&'static str, &'static str)>,
}

impl HeaderTemplate {
    pub fn chrome() -> Self {
        Self {
            name: "chrome",
            headers: vec![
                (
                    "User-Agent",
                    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
                ),
                ("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
                ("Accept-Language", "en-US,en;q=0.9"),
                ("Accept-Encoding", "gzip, deflate, br"),
                ("DNT", "1"),
                ("Connection", "keep-alive"),
                ("Upgrade-Insecure-Requests", "1"),
            ],
        }
    }
}

/// DPI 规避设置；分片在隧道层做，这里只负责请求头
#[derive(Debug, Clone)]
pub struct DpiEvasion {
    pub fragmentation: bool,
    pub header_obfuscation: bool,
    template: HeaderTemplate,
}

impl DpiEvasion {
    pub fn from_config(cfg: &DpiConfig) -> Self {
        Self {
            fragmentation: cfg.fragmentation,
            header_obfuscation: cfg.header_obfuscation,
            template: HeaderTemplate::chrome(),
        }
    }

    pub fn template(&self) -> &HeaderTemplate {
        &self.template
    }

    /// 改写成功返回新负载；非 HTTP/1.x 请求或头部不完整时返回 None
    pub fn rewrite_payload(&self, payload: &[u8]) -> Option<Vec<u8>> {
        if !self.header_obfuscation {
            return None;
        }
        let out = apply_header_template(payload, &self.template)?;
        trace!(template = self.template.name, before = payload.len(), after = out.len(), "headers reshaped");
        Some(out)
    }
}

/// 输出顺序：请求行、Host、模板头（已有的保留原值）、其余原始头
pub fn apply_header_template(payload: &[u8], template: &HeaderTemplate) -> Option<Vec<u8>> {
    if !is_http_request(payload) {
        return None;
    }
    let head_end = find_subslice(payload, b"\r\n\r\n")?;
    let head = std::str::from_utf8(&payload[..head_end]).ok()?;
    let body = &payload[head_end + 4..];

    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    if !(request_line.ends_with(" HTTP/1.1") || request_line.ends_with(" HTTP/1.0")) {
        return None;
    }

    let mut headers: Vec<(&str, &str)> = Vec::new();
    for line in lines {
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim(), value.trim()));
    }

    let mut out = String::with_capacity(head.len() + 256);
    out.push_str(request_line);
    out.push_str("\r\n");
    let mut emitted = vec![false; headers.len()];

    for (i, (name, value)) in headers.iter().enumerate() {
        if name.eq_ignore_ascii_case("host") {
            emit(&mut out, name, value);
            emitted[i] = true;
        }
    }
    for (tname, tvalue) in &template.headers {
        let existing = headers
            .iter()
            .enumerate()
            .filter(|(i, (name, _))| !emitted[*i] && name.eq_ignore_ascii_case(tname))
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        if existing.is_empty() {
            emit(&mut out, tname, tvalue);
        }
        for i in existing {
            let (name, value) = headers[i];
            emit(&mut out, name, value);
            emitted[i] = true;
        }
    }
    for (i, (name, value)) in headers.iter().enumerate() {
        if !emitted[i] {
            emit(&mut out, name, value);
        }
    }
    out.push_str("\r\n");

    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(body);
    Some(bytes)
}

fn emit(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}
