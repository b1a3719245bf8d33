use anyhow::{bail, Context, Result};
use std::io::BufRead;
use std::net::{IpAddr, SocketAddrV6};
use std::path::PathBuf;

use crate::wire::Question;

#[derive(Debug, Clone)]
pub struct Options {
    pub resolvers: Vec<SocketAddrV6>,
    pub questions: Vec<Question>,
    pub concurrent: u32,
    pub timeout: u64,
    pub retry: i32,
    pub keep_capacity: bool,
    pub quiet: bool,
    pub output: Option<PathBuf>,
    pub output_type: String,
    pub gzip: bool,
    pub append: bool,
    pub bind: Option<IpAddr>,
    pub progress_interval: u64,
    pub color: bool,
}

impl Options {
    pub fn check(&self) -> Result<()> {
        if self.questions.is_empty() {
            bail!("at least one query is required");
        }
        if self.resolvers.is_empty() {
            bail!("at least one resolver is required");
        }
        if self.concurrent < 1 {
            bail!("invalid value for --concurrent");
        }
        if self.timeout < 1 {
            bail!("invalid value for --timeout");
        }
        match self.output_type.to_lowercase().as_str() {
            "txt" | "jsonl" => Ok(()),
            other => bail!("unsupported output type {:?}", other),
        }
    }
}

/// Parse one resolver address. IPv4 addresses are widened to IPv4-mapped
/// IPv6 so a single dual-stack socket serves both families.
pub fn resolver_addr(s: &str, port: u16) -> Result<SocketAddrV6> {
    let ip: IpAddr = s.parse().with_context(|| format!("{:?} is not a valid IP", s))?;
    Ok(match ip {
        IpAddr::V4(v4) => SocketAddrV6::new(v4.to_ipv6_mapped(), port, 0, 0),
        IpAddr::V6(v6) => SocketAddrV6::new(v6, port, 0, 0),
    })
}

/// One IP per line; `#` comments and blank lines are skipped; duplicate
/// addresses are an error because they would split one resolver's txid
/// space across two slots.
pub fn parse_resolver_list<R: BufRead>(reader: R, port: u16) -> Result<Vec<SocketAddrV6>> {
    let mut resolvers: Vec<SocketAddrV6> = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.context("reading resolver list")?;
        let s = line.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let addr = resolver_addr(s, port).with_context(|| format!("line {}", lineno + 1))?;
        if resolvers.iter().any(|r| r.ip() == addr.ip()) {
            bail!("duplicate resolver address {} (line {})", s, lineno + 1);
        }
        resolvers.push(addr);
    }
    Ok(resolvers)
}

/// One question per line in `<name> [class] <type>` form; same comment and
/// blank-line rules as the resolver list.
pub fn parse_question_list<R: BufRead>(reader: R) -> Result<Vec<Question>> {
    let mut questions = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.context("reading query list")?;
        let s = line.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let q = Question::parse(s)
            .with_context(|| format!("{:?} is not a valid DNS question (line {})", s, lineno + 1))?;
        questions.push(q);
    }
    Ok(questions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use trust_dns_proto::rr::RecordType;

    #[test]
    fn resolver_list_skips_comments_and_maps_v4() {
        let input = "# public resolvers\n1.1.1.1\n\n  8.8.8.8  \n2001:4860:4860::8888\n";
        let list = parse_resolver_list(Cursor::new(input), 53).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].ip().to_string(), "::ffff:1.1.1.1");
        assert_eq!(list[0].port(), 53);
        assert_eq!(list[2].ip().to_string(), "2001:4860:4860::8888");
    }

    #[test]
    fn resolver_list_rejects_duplicates_and_garbage() {
        assert!(parse_resolver_list(Cursor::new("1.1.1.1\n1.1.1.1\n"), 53).is_err());
        // the same address in both notations is still one resolver
        assert!(parse_resolver_list(Cursor::new("1.1.1.1\n::ffff:1.1.1.1\n"), 53).is_err());
        assert!(parse_resolver_list(Cursor::new("not-an-ip\n"), 53).is_err());
    }

    #[test]
    fn resolver_list_honours_port() {
        let list = parse_resolver_list(Cursor::new("9.9.9.9\n"), 5353).unwrap();
        assert_eq!(list[0].port(), 5353);
    }

    #[test]
    fn question_list_parses_and_reports_bad_lines() {
        let input = "# queries\nexample.com A\nexample.org IN AAAA\n";
        let list = parse_question_list(Cursor::new(input)).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].qtype, RecordType::A);
        assert_eq!(list[1].qtype, RecordType::AAAA);

        let err = parse_question_list(Cursor::new("example.com BOGUS\n")).unwrap_err();
        assert!(format!("{err:#}").contains("line 1"));
    }

    #[test]
    fn options_check_validates() {
        let mut opt = Options {
            resolvers: parse_resolver_list(Cursor::new("1.1.1.1\n"), 53).unwrap(),
            questions: parse_question_list(Cursor::new("example.com A\n")).unwrap(),
            concurrent: 2,
            timeout: 6,
            retry: 3,
            keep_capacity: false,
            quiet: false,
            output: None,
            output_type: "txt".into(),
            gzip: false,
            append: false,
            bind: None,
            progress_interval: 1,
            color: false,
        };
        assert!(opt.check().is_ok());
        opt.output_type = "parquet".into();
        assert!(opt.check().is_err());
        opt.output_type = "jsonl".into();
        opt.questions.clear();
        assert!(opt.check().is_err());
    }
}
