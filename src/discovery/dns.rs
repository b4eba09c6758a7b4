// SPDX-License-Identifier: GPL-2.0-or-later

//! Just enough of the DNS wire format for DNS-SD over multicast:
//! queries with PTR/SRV/TXT/A/AAAA questions and response parsing
//! with name compression.

use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

pub(crate) const TYPE_A: u16 = 1;
pub(crate) const TYPE_PTR: u16 = 12;
pub(crate) const TYPE_TXT: u16 = 16;
pub(crate) const TYPE_AAAA: u16 = 28;
pub(crate) const TYPE_SRV: u16 = 33;

const CLASS_IN: u16 = 1;

// Top bit of the question class requests a unicast response,
// used for one-shot lookups from an ephemeral port.
const UNICAST_RESPONSE: u16 = 0x8000;

// Response bit in the header flags.
const FLAG_QR: u16 = 1 << 15;

// The cache-flush bit is not record class and must be masked off.
const CLASS_MASK: u16 = 0x7FFF;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseDnsError {
    #[error("unexpected end of message")]
    UnexpectedEof,

    #[error("too many compression pointer hops")]
    PointerLoop,

    #[error("record data length out of bounds")]
    BadRdataLength,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Question {
    pub name: String,
    pub qtype: u16,
    pub unicast_response: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Record {
    pub name: String,
    pub ttl: u32,
    pub data: RecordData,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RecordData {
    Ptr(String),
    Srv { port: u16, target: String },
    Txt(Vec<(String, Option<String>)>),
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Unsupported,
}

/// Builds a standard query message with id zero, as multicast queries
/// require.
pub(crate) fn build_query(questions: &[Question]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(512);

    // Header: id, flags, qdcount, ancount, nscount, arcount.
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&u16::try_from(questions.len()).unwrap_or(u16::MAX).to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());

    for question in questions {
        write_name(&mut msg, &question.name);
        msg.extend_from_slice(&question.qtype.to_be_bytes());
        let class = if question.unicast_response {
            CLASS_IN | UNICAST_RESPONSE
        } else {
            CLASS_IN
        };
        msg.extend_from_slice(&class.to_be_bytes());
    }
    msg
}

fn write_name(msg: &mut Vec<u8>, name: &str) {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        let len = u8::try_from(label.len()).unwrap_or(63).min(63);
        msg.push(len);
        msg.extend_from_slice(&label.as_bytes()[..usize::from(len)]);
    }
    msg.push(0);
}

/// Parses the answer and additional sections of a response message.
/// Queries yield an empty list.
pub(crate) fn parse_response(buf: &[u8]) -> Result<Vec<Record>, ParseDnsError> {
    use ParseDnsError::*;

    let flags = read_u16(buf, 2)?;
    if flags & FLAG_QR == 0 {
        return Ok(Vec::new());
    }
    let qdcount = read_u16(buf, 4)?;
    let ancount = read_u16(buf, 6)?;
    let nscount = read_u16(buf, 8)?;
    let arcount = read_u16(buf, 10)?;

    let mut pos = 12;

    // Skip questions.
    for _ in 0..qdcount {
        let (_, next) = read_name(buf, pos)?;
        pos = next.checked_add(4).ok_or(UnexpectedEof)?;
    }

    let mut records = Vec::new();
    for i in 0..u32::from(ancount) + u32::from(nscount) + u32::from(arcount) {
        let (name, next) = read_name(buf, pos)?;
        pos = next;

        let rtype = read_u16(buf, pos)?;
        let _class = read_u16(buf, pos + 2)? & CLASS_MASK;
        let ttl = read_u32(buf, pos + 4)?;
        let rdlength = usize::from(read_u16(buf, pos + 8)?);
        pos += 10;

        let rdata_end = pos.checked_add(rdlength).ok_or(BadRdataLength)?;
        if rdata_end > buf.len() {
            return Err(BadRdataLength);
        }

        // Authority records are irrelevant to service browsing.
        let in_authority = u32::from(ancount) <= i && i < u32::from(ancount) + u32::from(nscount);
        if !in_authority {
            let data = parse_rdata(buf, pos, rdlength, rtype)?;
            records.push(Record { name, ttl, data });
        }
        pos = rdata_end;
    }
    Ok(records)
}

fn parse_rdata(
    buf: &[u8],
    pos: usize,
    rdlength: usize,
    rtype: u16,
) -> Result<RecordData, ParseDnsError> {
    use ParseDnsError::*;

    let rdata = &buf[pos..pos + rdlength];
    Ok(match rtype {
        TYPE_PTR => {
            let (target, _) = read_name(buf, pos)?;
            RecordData::Ptr(target)
        }
        TYPE_SRV => {
            // Priority and weight are ignored.
            let port = read_u16(buf, pos + 4)?;
            let (target, _) = read_name(buf, pos + 6)?;
            RecordData::Srv { port, target }
        }
        TYPE_TXT => RecordData::Txt(parse_txt(rdata)),
        TYPE_A => {
            let octets: [u8; 4] = rdata.try_into().map_err(|_| BadRdataLength)?;
            RecordData::A(Ipv4Addr::from(octets))
        }
        TYPE_AAAA => {
            let octets: [u8; 16] = rdata.try_into().map_err(|_| BadRdataLength)?;
            RecordData::Aaaa(Ipv6Addr::from(octets))
        }
        _ => RecordData::Unsupported,
    })
}

fn parse_txt(rdata: &[u8]) -> Vec<(String, Option<String>)> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < rdata.len() {
        let len = usize::from(rdata[pos]);
        pos += 1;
        let Some(entry) = rdata.get(pos..pos + len) else {
            break;
        };
        pos += len;
        if entry.is_empty() {
            continue;
        }
        let entry = String::from_utf8_lossy(entry);
        match entry.split_once('=') {
            Some((key, value)) => entries.push((key.to_owned(), Some(value.to_owned()))),
            None => entries.push((entry.into_owned(), None)),
        }
    }
    entries
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16, ParseDnsError> {
    let bytes = buf
        .get(pos..pos + 2)
        .ok_or(ParseDnsError::UnexpectedEof)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32, ParseDnsError> {
    let bytes = buf
        .get(pos..pos + 4)
        .ok_or(ParseDnsError::UnexpectedEof)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Reads a possibly compressed name. Returns the name with a trailing
/// dot and the offset just past it in the uncompressed stream.
fn read_name(buf: &[u8], mut pos: usize) -> Result<(String, usize), ParseDnsError> {
    use ParseDnsError::*;

    let mut labels: Vec<String> = Vec::new();
    let mut end = None;
    let mut hops = 0;
    loop {
        let len = *buf.get(pos).ok_or(UnexpectedEof)?;
        if len & 0xC0 == 0xC0 {
            let low = *buf.get(pos + 1).ok_or(UnexpectedEof)?;
            if end.is_none() {
                end = Some(pos + 2);
            }
            hops += 1;
            if hops > 32 {
                return Err(PointerLoop);
            }
            pos = (usize::from(len & 0x3F) << 8) | usize::from(low);
        } else if len == 0 {
            pos += 1;
            break;
        } else {
            let start = pos + 1;
            let stop = start + usize::from(len);
            let label = buf.get(start..stop).ok_or(UnexpectedEof)?;
            labels.push(String::from_utf8_lossy(label).into_owned());
            pos = stop;
        }
    }

    let mut name = labels.join(".");
    name.push('.');
    Ok((name, end.unwrap_or(pos)))
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn push_name(buf: &mut Vec<u8>, name: &str) {
        write_name(buf, name);
    }

    // Hand-built response: one question, then a PTR answer whose target
    // uses a compression pointer, an SRV, a TXT and an A record.
    fn sample_response() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u16.to_be_bytes()); // id
        buf.extend_from_slice(&FLAG_QR.to_be_bytes()); // flags
        buf.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        buf.extend_from_slice(&4u16.to_be_bytes()); // ancount
        buf.extend_from_slice(&0u16.to_be_bytes()); // nscount
        buf.extend_from_slice(&0u16.to_be_bytes()); // arcount

        // Question: PTR _rtsp._tcp.local.
        let question_name = buf.len();
        push_name(&mut buf, "_rtsp._tcp.local.");
        buf.extend_from_slice(&TYPE_PTR.to_be_bytes());
        buf.extend_from_slice(&CLASS_IN.to_be_bytes());

        // PTR answer: name compressed to the question name, target
        // "glasses" + pointer to the question name.
        buf.extend_from_slice(&[0xC0, u8::try_from(question_name).unwrap()]);
        buf.extend_from_slice(&TYPE_PTR.to_be_bytes());
        buf.extend_from_slice(&CLASS_IN.to_be_bytes());
        buf.extend_from_slice(&120u32.to_be_bytes());
        let rdlength = 1 + "glasses".len() + 2;
        buf.extend_from_slice(&u16::try_from(rdlength).unwrap().to_be_bytes());
        buf.push(7);
        buf.extend_from_slice(b"glasses");
        buf.extend_from_slice(&[0xC0, u8::try_from(question_name).unwrap()]);

        // SRV answer.
        push_name(&mut buf, "glasses._rtsp._tcp.local.");
        buf.extend_from_slice(&TYPE_SRV.to_be_bytes());
        buf.extend_from_slice(&CLASS_IN.to_be_bytes());
        buf.extend_from_slice(&120u32.to_be_bytes());
        let mut srv = Vec::new();
        srv.extend_from_slice(&0u16.to_be_bytes()); // priority
        srv.extend_from_slice(&0u16.to_be_bytes()); // weight
        srv.extend_from_slice(&8554u16.to_be_bytes()); // port
        push_name(&mut srv, "glasses.local.");
        buf.extend_from_slice(&u16::try_from(srv.len()).unwrap().to_be_bytes());
        buf.extend_from_slice(&srv);

        // TXT answer.
        push_name(&mut buf, "glasses._rtsp._tcp.local.");
        buf.extend_from_slice(&TYPE_TXT.to_be_bytes());
        buf.extend_from_slice(&CLASS_IN.to_be_bytes());
        buf.extend_from_slice(&120u32.to_be_bytes());
        let txt = b"\x0epath=/live/all\x08revision";
        buf.extend_from_slice(&u16::try_from(txt.len()).unwrap().to_be_bytes());
        buf.extend_from_slice(txt);

        // A answer.
        push_name(&mut buf, "glasses.local.");
        buf.extend_from_slice(&TYPE_A.to_be_bytes());
        buf.extend_from_slice(&CLASS_IN.to_be_bytes());
        buf.extend_from_slice(&120u32.to_be_bytes());
        buf.extend_from_slice(&4u16.to_be_bytes());
        buf.extend_from_slice(&[192, 168, 1, 10]);

        buf
    }

    #[test]
    fn test_parse_response() {
        let records = parse_response(&sample_response()).unwrap();
        assert_eq!(
            vec![
                Record {
                    name: "_rtsp._tcp.local.".to_owned(),
                    ttl: 120,
                    data: RecordData::Ptr("glasses._rtsp._tcp.local.".to_owned()),
                },
                Record {
                    name: "glasses._rtsp._tcp.local.".to_owned(),
                    ttl: 120,
                    data: RecordData::Srv {
                        port: 8554,
                        target: "glasses.local.".to_owned(),
                    },
                },
                Record {
                    name: "glasses._rtsp._tcp.local.".to_owned(),
                    ttl: 120,
                    data: RecordData::Txt(vec![
                        ("path".to_owned(), Some("/live/all".to_owned())),
                        ("revision".to_owned(), None),
                    ]),
                },
                Record {
                    name: "glasses.local.".to_owned(),
                    ttl: 120,
                    data: RecordData::A(Ipv4Addr::new(192, 168, 1, 10)),
                },
            ],
            records,
        );
    }

    #[test]
    fn test_queries_are_not_responses() {
        let query = build_query(&[Question {
            name: "_tobii-g3api._tcp.local.".to_owned(),
            qtype: TYPE_PTR,
            unicast_response: false,
        }]);
        assert_eq!(Vec::<Record>::new(), parse_response(&query).unwrap());
    }

    #[test]
    fn test_build_query_layout() {
        let query = build_query(&[Question {
            name: "x.local.".to_owned(),
            qtype: TYPE_SRV,
            unicast_response: true,
        }]);

        // Header.
        assert_eq!([0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0], query[..12]);
        // Name.
        assert_eq!(b"\x01x\x05local\x00", &query[12..21]);
        // Type and class with the unicast-response bit.
        assert_eq!([0, 33, 0x80, 1], query[21..25]);
    }

    #[test]
    fn test_truncated_message() {
        let mut buf = sample_response();
        // Cut into the last record's data.
        buf.truncate(buf.len() - 2);
        assert_eq!(Err(ParseDnsError::BadRdataLength), parse_response(&buf));

        // Cut into the last record's header.
        buf.truncate(buf.len() - 6);
        assert_eq!(Err(ParseDnsError::UnexpectedEof), parse_response(&buf));
    }

    #[test]
    fn test_pointer_loop() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&FLAG_QR.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        // Question name that points at itself.
        buf.extend_from_slice(&[0xC0, 12]);
        buf.extend_from_slice(&TYPE_PTR.to_be_bytes());
        buf.extend_from_slice(&CLASS_IN.to_be_bytes());
        assert_eq!(Err(ParseDnsError::PointerLoop), parse_response(&buf));
    }
}
