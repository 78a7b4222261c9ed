/// 流量分类嗅探：从首包负载里识别协议并提取域名。
///
/// - TLS ClientHello → SNI
/// - HTTP/1.x 请求 → Host 头
/// - DNS 查询 → 第一个问题的 QNAME
use super::Protocol;

/// 嗅探结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sniffed {
    pub protocol: Option<Protocol>,
    pub domain: Option<String>,
}

/// 按负载内容嗅探；`dest_port == 53` 时按 DNS 报文解析
pub fn sniff(data: &[u8], dest_port: u16) -> Sniffed {
    if dest_port == 53 {
        if let Some(name) = parse_dns_qname(data) {
            return Sniffed {
                protocol: Some(Protocol::Dns),
                domain: Some(name),
            };
        }
    }
    if is_tls_handshake(data) {
        return Sniffed {
            protocol: Some(Protocol::Https),
            domain: parse_tls_sni(data),
        };
    }
    if is_http_request(data) {
        return Sniffed {
            protocol: Some(Protocol::Http),
            domain: parse_http_host(data),
        };
    }
    Sniffed::default()
}

/// 简单的只读游标，越界一律返回 None
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let v = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(v)
    }

    fn u16(&mut self) -> Option<u16> {
        let b = self.take(2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        let b = self.take(3)?;
        Some(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let s = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(s)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }
}

fn is_tls_handshake(data: &[u8]) -> bool {
    data.len() >= 5 && data[0] == 0x16 && data[1] == 0x03 && data[2] <= 0x03
}

/// 从 TLS ClientHello 中提取 SNI
pub fn parse_tls_sni(data: &[u8]) -> Option<String> {
    let mut rec = Reader::new(data);
    if rec.u8()? != 0x16 {
        return None;
    }
    rec.skip(2)?;
    let record_len = rec.u16()? as usize;
    let mut hs = Reader::new(rec.take(record_len)?);

    // 0x01 = ClientHello
    if hs.u8()? != 0x01 {
        return None;
    }
    let body_len = hs.u24()?;
    let mut body = Reader::new(hs.take(body_len)?);

    body.skip(2 + 32)?; // version + random
    let sid_len = body.u8()? as usize;
    body.skip(sid_len)?;
    let suites_len = body.u16()? as usize;
    body.skip(suites_len)?;
    let comp_len = body.u8()? as usize;
    body.skip(comp_len)?;

    let ext_len = body.u16()? as usize;
    let mut exts = Reader::new(body.take(ext_len)?);
    while let (Some(ext_type), Some(len)) = (exts.u16(), exts.u16()) {
        let ext = exts.take(len as usize)?;
        if ext_type == 0x0000 {
            return parse_server_name_ext(ext);
        }
    }
    None
}

fn parse_server_name_ext(ext: &[u8]) -> Option<String> {
    let mut r = Reader::new(ext);
    let list_len = r.u16()? as usize;
    let mut list = Reader::new(r.take(list_len)?);
    loop {
        let name_type = list.u8()?;
        let len = list.u16()? as usize;
        let name = list.take(len)?;
        if name_type == 0 {
            return std::str::from_utf8(name).ok().map(str::to_ascii_lowercase);
        }
    }
}

const HTTP_METHODS: &[&[u8]] = &[
    b"GET ", b"POST ", b"PUT ", b"HEAD ", b"DELETE ", b"OPTIONS ", b"PATCH ", b"CONNECT ",
];

pub fn is_http_request(data: &[u8]) -> bool {
    HTTP_METHODS.iter().any(|m| data.starts_with(m))
}

/// 从 HTTP 请求头中提取 Host（去掉端口）
pub fn parse_http_host(data: &[u8]) -> Option<String> {
    if !is_http_request(data) {
        return None;
    }
    // 只看头部，负载可能不是 UTF-8
    let head_end = find_subslice(data, b"\r\n\r\n").unwrap_or(data.len());
    let head = std::str::from_utf8(&data[..head_end]).ok()?;

    for line in head.lines().skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("host") {
            continue;
        }
        let host = value.trim();
        let hostname = match host.rsplit_once(':') {
            Some((h, port)) if !port.is_empty() && port.bytes().all(|c| c.is_ascii_digit()) => h,
            _ => host,
        };
        let hostname = hostname.trim_start_matches('[').trim_end_matches(']');
        if !hostname.is_empty() {
            return Some(hostname.to_ascii_lowercase());
        }
    }
    None
}

/// 请求行中的目标（`GET /path HTTP/1.1` 里的 `/path`）
pub fn parse_http_target(data: &[u8]) -> Option<String> {
    if !is_http_request(data) {
        return None;
    }
    let line_end = find_subslice(data, b"\r\n").unwrap_or(data.len());
    let line = std::str::from_utf8(&data[..line_end]).ok()?;
    let mut parts = line.split_ascii_whitespace();
    parts.next()?;
    parts.next().map(str::to_string)
}

/// 解析 DNS 查询报文中的第一个 QNAME（不支持压缩指针，查询报文里不会出现）
pub fn parse_dns_qname(data: &[u8]) -> Option<String> {
    let mut r = Reader::new(data);
    r.skip(2)?; // id
    let flags = r.u16()?;
    // QR 位为 1 表示应答
    if flags & 0x8000 != 0 {
        return None;
    }
    let qdcount = r.u16()?;
    if qdcount == 0 {
        return None;
    }
    r.skip(6)?;

    let mut labels: Vec<&str> = Vec::new();
    loop {
        let len = r.u8()? as usize;
        if len == 0 {
            break;
        }
        if len > 63 {
            return None;
        }
        labels.push(std::str::from_utf8(r.take(len)?).ok()?);
    }
    if labels.is_empty() {
        return None;
    }
    Some(labels.join(".").to_ascii_lowercase())
}

pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 构造只带 SNI 扩展的最小 ClientHello
    pub(crate) fn client_hello(sni: &str) -> Vec<u8> {
        let name = sni.as_bytes();
        let mut sni_ext = Vec::new();
        sni_ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        sni_ext.push(0);
        sni_ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(name);

        let mut exts = Vec::new();
        exts.extend_from_slice(&0u16.to_be_bytes());
        exts.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        exts.extend_from_slice(&sni_ext);

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]);
        body.push(0); // session id
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one suite
        body.extend_from_slice(&[0x01, 0x00]); // null compression
        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);

        let mut hs = vec![0x01];
        hs.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        hs.extend_from_slice(&body);

        let mut rec = vec![0x16, 0x03, 0x01];
        rec.extend_from_slice(&(hs.len() as u16).to_be_bytes());
        rec.extend_from_slice(&hs);
        rec
    }

    pub(crate) fn dns_query(name: &str) -> Vec<u8> {
        let mut q = vec![0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        for label in name.split('.') {
            q.push(label.len() as u8);
            q.extend_from_slice(label.as_bytes());
        }
        q.push(0);
        q.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        q
    }

    #[test]
    fn sniff_tls_sni() {
        let s = sniff(&client_hello("Video.Example.com"), 443);
        assert_eq!(s.protocol, Some(Protocol::Https));
        assert_eq!(s.domain.as_deref(), Some("video.example.com"));
    }

    #[test]
    fn truncated_client_hello_yields_no_domain() {
        let mut hello = client_hello("example.com");
        hello.truncate(hello.len() - 4);
        assert_eq!(parse_tls_sni(&hello), None);
    }

    #[test]
    fn sniff_http_host() {
        let req = b"GET /index.html HTTP/1.1\r\nUser-Agent: x\r\nhost: ads.example.net:8080\r\n\r\n";
        let s = sniff(req, 80);
        assert_eq!(s.protocol, Some(Protocol::Http));
        assert_eq!(s.domain.as_deref(), Some("ads.example.net"));
    }

    #[test]
    fn sniff_dns_query() {
        let s = sniff(&dns_query("tracker.example.org"), 53);
        assert_eq!(s.protocol, Some(Protocol::Dns));
        assert_eq!(s.domain.as_deref(), Some("tracker.example.org"));
    }

    #[test]
    fn dns_response_is_ignored() {
        let mut q = dns_query("example.org");
        q[2] |= 0x80;
        assert_eq!(parse_dns_qname(&q), None);
    }

    #[test]
    fn http_request_target() {
        let req = b"GET /a/b?c=1 HTTP/1.1\r\nHost: x\r\n\r\n";
        assert_eq!(parse_http_target(req).as_deref(), Some("/a/b?c=1"));
        let proxied = b"GET http://x.example/p HTTP/1.1\r\n\r\n";
        assert_eq!(parse_http_target(proxied).as_deref(), Some("http://x.example/p"));
        assert_eq!(parse_http_target(b"\x16\x03\x01"), None);
    }

    #[test]
    fn unknown_payload() {
        assert_eq!(sniff(b"\x00\x01garbage", 9999), Sniffed::default());
        assert_eq!(sniff(&[], 53), Sniffed::default());
    }
}
