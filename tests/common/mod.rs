#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ad_shield::dns::build_query;
use hickory_proto::op::{Header, Message};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::net::UdpSocket;

pub fn query(id: u16, name: &str, qtype: RecordType) -> Vec<u8> {
    build_query(id, &Name::from_str(name).unwrap(), qtype).unwrap()
}

/// An upstream-style answer to `query` carrying one A record.
pub fn answer(query: &[u8], ip: Ipv4Addr, ttl: u32) -> Vec<u8> {
    let request = Message::from_vec(query).unwrap();
    let mut response = Message::new();
    response.set_header(Header::response_from_request(request.header()));
    response.add_queries(request.queries().iter().cloned());
    let name = request.queries()[0].name().clone();
    response.add_answer(Record::from_rdata(name, ttl, RData::A(A(ip))));
    response.to_vec().unwrap()
}

pub struct FakeUpstream {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
}

/// Loopback UDP resolver answering every query with `ip`, or staying
/// silent when `ip` is `None`.
pub async fn spawn_upstream(ip: Option<Ipv4Addr>) -> FakeUpstream {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(ip) = ip {
                let response = answer(&buf[..len], ip, 300);
                let _ = socket.send_to(&response, peer).await;
            }
        }
    });

    FakeUpstream { addr, hits }
}
