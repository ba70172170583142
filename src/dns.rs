//! DNS wire helpers: question extraction, sinkhole synthesis, id and TTL
//! rewriting of cached answers, CNAME rewrites.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use hickory_proto::op::{Header, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::ProtoError;
use serde::Deserialize;

/// How a blocked query is answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockResponse {
    /// `0.0.0.0` for A, `::` for AAAA, NXDOMAIN for other types.
    #[default]
    NullIp,
    Nxdomain,
}

/// The question of an intercepted query.
#[derive(Debug, Clone)]
pub struct QueryInfo {
    pub id: u16,
    /// Lowercased, without the trailing dot.
    pub name: Arc<str>,
    pub qtype: RecordType,
    pub message: Message,
}

/// `None` for anything that is not a standard query with a question.
pub fn parse_query(bytes: &[u8]) -> Option<QueryInfo> {
    let message = Message::from_vec(bytes).ok()?;
    if message.message_type() != MessageType::Query || message.op_code() != OpCode::Query {
        return None;
    }
    let query = message.queries().first()?;
    let name = crate::domain::normalize_query_name(&query.name().to_ascii());
    Some(QueryInfo {
        id: message.id(),
        name: name.into(),
        qtype: query.query_type(),
        message,
    })
}

fn response_to(request: &Message) -> Message {
    let mut header = Header::response_from_request(request.header());
    header.set_recursion_available(true);
    let mut response = Message::new();
    response.set_header(header);
    response.add_queries(request.queries().iter().cloned());
    response
}

pub fn block_response(
    request: &Message,
    mode: BlockResponse,
    ttl: u32,
) -> Result<Vec<u8>, ProtoError> {
    let mut response = response_to(request);
    let query = request.queries().first();

    let rdata = match (mode, query.map(|q| q.query_type())) {
        (BlockResponse::NullIp, Some(RecordType::A)) => Some(RData::A(A(Ipv4Addr::UNSPECIFIED))),
        (BlockResponse::NullIp, Some(RecordType::AAAA)) => {
            Some(RData::AAAA(AAAA(Ipv6Addr::UNSPECIFIED)))
        }
        _ => None,
    };

    match (rdata, query) {
        (Some(rdata), Some(query)) => {
            response.add_answer(Record::from_rdata(query.name().clone(), ttl, rdata));
        }
        _ => {
            response.set_response_code(ResponseCode::NXDomain);
        }
    }
    response.to_vec()
}

/// A recursive query for `name`, used to follow a rewrite target.
pub fn build_query(id: u16, name: &Name, qtype: RecordType) -> Result<Vec<u8>, ProtoError> {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name.clone(), qtype));
    message.to_vec()
}

/// Answer `request` with `owner CNAME target` followed by the answers of
/// `target_response`, whose response code is carried over.
pub fn cname_response(
    request: &Message,
    target: &Name,
    target_response: &[u8],
    ttl: u32,
) -> Result<Vec<u8>, ProtoError> {
    let upstream = Message::from_vec(target_response)?;
    let mut response = response_to(request);
    if let Some(query) = request.queries().first() {
        response.add_answer(Record::from_rdata(
            query.name().clone(),
            ttl,
            RData::CNAME(CNAME(target.clone())),
        ));
    }
    response.add_answers(upstream.answers().iter().cloned());
    response.set_response_code(upstream.response_code());
    response.to_vec()
}

pub fn rewrite_id(message: &mut [u8], id: u16) {
    if message.len() >= 2 {
        message[..2].copy_from_slice(&id.to_be_bytes());
    }
}

/// Smallest TTL across answers, or the authority TTL of a negative answer.
pub fn min_ttl(response: &[u8]) -> Option<u32> {
    let message = Message::from_vec(response).ok()?;
    message
        .answers()
        .iter()
        .map(Record::ttl)
        .min()
        .or_else(|| message.name_servers().iter().map(Record::ttl).min())
}

pub fn response_code(response: &[u8]) -> Option<ResponseCode> {
    Message::from_vec(response).ok().map(|m| m.response_code())
}

/// A cached answer handed to a new caller: its id, and every TTL reduced by
/// the time spent in the cache.
pub fn age_cached(response: &[u8], id: u16, elapsed_secs: u32) -> Vec<u8> {
    let aged = Message::from_vec(response).and_then(|mut message| {
        message.set_id(id);
        let age = |records: &mut Vec<Record>| {
            for record in records.iter_mut() {
                let ttl = record.ttl().saturating_sub(elapsed_secs);
                record.set_ttl(ttl);
            }
        };
        age(message.answers_mut());
        age(message.name_servers_mut());
        age(message.additionals_mut());
        message.to_vec()
    });

    aged.unwrap_or_else(|_| {
        let mut raw = response.to_vec();
        rewrite_id(&mut raw, id);
        raw
    })
}
