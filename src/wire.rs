use anyhow::{bail, Context, Result};
use std::net::IpAddr;
use trust_dns_proto::op::{Message, MessageType, OpCode, Query};
use trust_dns_proto::rr::{DNSClass, Name, RData, RecordType};
use trust_dns_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};

/// One DNS question in text form, e.g. `example.com A` or `example.com IN A`.
/// The class defaults to IN when omitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: DNSClass,
}

impl Question {
    pub fn new(name: impl Into<String>, qtype: RecordType) -> Self {
        Question { name: name.into(), qtype, qclass: DNSClass::IN }
    }

    /// Parse `<name> <type>` or `<name> <class> <type>`.
    pub fn parse(line: &str) -> Result<Self> {
        let items: Vec<&str> = line.split_whitespace().collect();
        let (name, class, rtype) = match items.as_slice() {
            [name, rtype] => (*name, "IN", *rtype),
            [name, class, rtype] => (*name, *class, *rtype),
            _ => bail!("expected '<name> <type>' or '<name> <class> <type>', got {:?}", line),
        };

        // validate the name up front so bad input fails at load, not at send
        Name::from_utf8(name).with_context(|| format!("invalid name {:?}", name))?;

        Ok(Question {
            name: name.to_string(),
            qtype: parse_qtype(rtype)?,
            qclass: parse_qclass(class)?,
        })
    }
}

fn parse_qtype(s: &str) -> Result<RecordType> {
    Ok(match s.to_ascii_uppercase().as_str() {
        "A" => RecordType::A,
        "NS" => RecordType::NS,
        "CNAME" => RecordType::CNAME,
        "SOA" => RecordType::SOA,
        "PTR" => RecordType::PTR,
        "MX" => RecordType::MX,
        "TXT" => RecordType::TXT,
        "AAAA" => RecordType::AAAA,
        "ANY" => RecordType::ANY,
        other => bail!("unsupported record type {:?}", other),
    })
}

fn parse_qclass(s: &str) -> Result<DNSClass> {
    Ok(match s.to_ascii_uppercase().as_str() {
        "IN" => DNSClass::IN,
        "CH" => DNSClass::CH,
        "ANY" => DNSClass::ANY,
        other => bail!("unsupported class {:?}", other),
    })
}

/// Build the wire form of a query: opcode QUERY, RD=1, answer bit clear,
/// exactly one question and empty answer/authority/additional sections.
pub fn encode_query(txid: u16, question: &Question) -> Result<Vec<u8>> {
    let mut msg = Message::new();
    msg.set_id(txid);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    let name = Name::from_utf8(&question.name)?;
    let mut query = Query::query(name, question.qtype);
    query.set_query_class(question.qclass);
    msg.add_query(query);

    let mut buf: Vec<u8> = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut buf);
    msg.emit(&mut encoder)?;
    Ok(buf)
}

/// Decode an incoming datagram. A message whose answer bit is clear is
/// rejected here so the receive path only ever sees responses.
pub fn decode_response(data: &[u8]) -> Result<Message> {
    let msg = Message::from_bytes(data).context("malformed DNS message")?;
    if msg.message_type() != MessageType::Response {
        bail!("answer bit is clear");
    }
    Ok(msg)
}

/// The 16 address bytes used in the pending key. IPv4 peers are widened to
/// their IPv4-mapped IPv6 form so both families key identically.
pub fn ip_bytes(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Pending-table key: 16 address bytes followed by the big-endian txid.
/// The port is deliberately not part of the key; answers may come back from
/// whatever source port the resolver chose.
pub fn pending_key(ip: IpAddr, txid: u16) -> [u8; 18] {
    let mut key = [0u8; 18];
    key[..16].copy_from_slice(&ip_bytes(ip));
    key[16..].copy_from_slice(&txid.to_be_bytes());
    key
}

pub fn class_str(class: DNSClass) -> &'static str {
    match class {
        DNSClass::IN => "IN",
        DNSClass::CH => "CH",
        DNSClass::ANY => "ANY",
        _ => "??",
    }
}

pub fn rdata_string(data: &RData) -> String {
    match data {
        RData::A(ip) => ip.to_string(),
        RData::AAAA(ip) => ip.to_string(),
        RData::NS(name) => name.to_string(),
        RData::CNAME(name) => name.to_string(),
        RData::PTR(name) => name.to_string(),
        RData::MX(mx) => format!("{} {}", mx.preference(), mx.exchange()),
        RData::SOA(soa) => format!(
            "{} {} {} {} {} {} {}",
            soa.mname(),
            soa.rname(),
            soa.serial(),
            soa.refresh(),
            soa.retry(),
            soa.expire(),
            soa.minimum()
        ),
        RData::TXT(txt) => txt.to_string(),
        _ => "???".to_string(),
    }
}
