//! Queries towards upstream name servers.
//!
//! Secondary and caching zones talk to their configured upstreams: SOA
//! polls and on-demand record fetches go out over UDP, zone transfers
//! over TCP. The [`Upstream`] trait is the seam the zone engine consumes —
//! it returns decoded answer sets, not wire messages — and
//! [`DnsUpstream`] is the real implementation over the `domain` client
//! transports.

use core::future::Future;
use core::pin::Pin;
use core::time::Duration;
use std::net::SocketAddr;

use bytes::Bytes;
use domain::base::iana::{OptRcode, Rtype};
use domain::base::name::ToName;
use domain::base::{Message, MessageBuilder, Ttl};
use domain::net::client::dgram;
use domain::net::client::protocol::UdpConnect;
use domain::net::client::request::{
    GetResponse, GetResponseMulti, RequestMessage, RequestMessageMulti,
    SendRequest, SendRequestMulti,
};
use domain::net::client::stream;
use domain::rdata::Soa;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::UpstreamError;
use crate::rdata::{RegistryRecordData, StoredName, StoredRecord};

//------------ Upstream ------------------------------------------------------

/// The answer-set view of a zone's upstream servers.
pub trait Upstream: Send + Sync {
    /// Queries for records of the given type at the given name.
    ///
    /// An authoritative name-error answer decodes to an empty set;
    /// transport failures and other error responses are errors.
    fn query(
        &self,
        qname: StoredName,
        rtype: Rtype,
    ) -> Pin<
        Box<
            dyn Future<Output = Result<Vec<StoredRecord>, UpstreamError>>
                + Send
                + '_,
        >,
    >;

    /// Requests a full zone transfer.
    ///
    /// The returned records include the opening and closing SOA.
    fn transfer(
        &self,
        apex: StoredName,
    ) -> Pin<
        Box<
            dyn Future<Output = Result<Vec<StoredRecord>, UpstreamError>>
                + Send
                + '_,
        >,
    >;

    /// Fetches the zone's SOA record and its TTL.
    fn query_soa(
        &self,
        apex: StoredName,
    ) -> Pin<
        Box<
            dyn Future<
                    Output = Result<(Soa<StoredName>, Ttl), UpstreamError>,
                > + Send
                + '_,
        >,
    > {
        Box::pin(async move {
            let records = self.query(apex, Rtype::SOA).await?;
            for record in records {
                if let RegistryRecordData::Soa(soa) = record.data() {
                    return Ok((soa.clone(), record.ttl()));
                }
            }
            Err(UpstreamError::Empty)
        })
    }
}

//------------ DnsUpstream ---------------------------------------------------

/// The real upstream client over UDP and TCP.
///
/// Servers are tried in configuration order; the first one that answers
/// wins. In-flight requests are bounded by the transport read timeout,
/// not cancelled.
pub struct DnsUpstream {
    servers: Vec<SocketAddr>,
}

impl DnsUpstream {
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        DnsUpstream { servers }
    }

    fn question(
        qname: &StoredName,
        rtype: Rtype,
    ) -> Message<Vec<u8>> {
        let mut builder = MessageBuilder::new_vec().question();
        builder.push((qname, rtype)).expect("question fits");
        builder.into_message()
    }

    async fn query_addr(
        server: SocketAddr,
        qname: &StoredName,
        rtype: Rtype,
    ) -> Result<Vec<StoredRecord>, UpstreamError> {
        let mut config = dgram::Config::new();
        config.set_read_timeout(Duration::from_millis(1000));
        config.set_max_retries(1);
        config.set_udp_payload_size(Some(1400));
        let conn =
            dgram::Connection::with_config(UdpConnect::new(server), config);

        let req = RequestMessage::new(Self::question(qname, rtype))
            .map_err(|err| UpstreamError::Request(err.to_string()))?;
        trace!("querying {server} for {rtype} {qname}");
        let msg = conn
            .send_request(req)
            .get_response()
            .await
            .map_err(|err| UpstreamError::Request(err.to_string()))?;

        if msg.no_error() {
            decode_answers(&msg)
        } else if msg.opt_rcode() == OptRcode::NXDOMAIN {
            Ok(Vec::new())
        } else {
            Err(UpstreamError::Rcode(msg.opt_rcode()))
        }
    }

    async fn transfer_addr(
        server: SocketAddr,
        apex: &StoredName,
    ) -> Result<Vec<StoredRecord>, UpstreamError> {
        let mut config = stream::Config::new();
        config.set_response_timeout(Duration::from_secs(2));
        config.set_idle_timeout(Duration::from_secs(5));
        config.set_streaming_response_timeout(Duration::from_secs(30));

        let tcp = TcpStream::connect(server)
            .await
            .map_err(|err| UpstreamError::Request(err.to_string()))?;
        let (conn, transport) = stream::Connection::<
            RequestMessage<Vec<u8>>,
            RequestMessageMulti<Vec<u8>>,
        >::with_config(tcp, config);
        tokio::spawn(async move {
            transport.run().await;
            trace!("transfer connection terminated");
        });

        let req =
            RequestMessageMulti::new(Self::question(apex, Rtype::AXFR))
                .map_err(|err| UpstreamError::Request(err.to_string()))?;
        let mut response = SendRequestMulti::send_request(&conn, req);

        let mut records = Vec::new();
        let mut soa_count = 0;
        loop {
            let msg = response
                .get_response()
                .await
                .map_err(|err| UpstreamError::Request(err.to_string()))?;
            let Some(msg) = msg else {
                return Err(UpstreamError::IncompleteTransfer);
            };
            if msg.is_error() {
                return Err(UpstreamError::Rcode(msg.opt_rcode()));
            }
            for record in decode_answers(&msg)? {
                if record.rtype() == Rtype::SOA {
                    soa_count += 1;
                }
                records.push(record);
                if soa_count == 2 {
                    return Ok(records);
                }
            }
        }
    }
}

impl Upstream for DnsUpstream {
    fn query(
        &self,
        qname: StoredName,
        rtype: Rtype,
    ) -> Pin<
        Box<
            dyn Future<Output = Result<Vec<StoredRecord>, UpstreamError>>
                + Send
                + '_,
        >,
    > {
        Box::pin(async move {
            let mut last_err = UpstreamError::NoServers;
            for &server in &self.servers {
                match Self::query_addr(server, &qname, rtype).await {
                    Ok(records) => return Ok(records),
                    Err(err) => {
                        debug!("upstream {server} failed: {err}");
                        last_err = err;
                    }
                }
            }
            Err(last_err)
        })
    }

    fn transfer(
        &self,
        apex: StoredName,
    ) -> Pin<
        Box<
            dyn Future<Output = Result<Vec<StoredRecord>, UpstreamError>>
                + Send
                + '_,
        >,
    > {
        Box::pin(async move {
            let mut last_err = UpstreamError::NoServers;
            for &server in &self.servers {
                match Self::transfer_addr(server, &apex).await {
                    Ok(records) => return Ok(records),
                    Err(err) => {
                        debug!("transfer from {server} failed: {err}");
                        last_err = err;
                    }
                }
            }
            Err(last_err)
        })
    }
}

//------------ decode_answers ------------------------------------------------

/// Decodes the answer section into stored records.
///
/// Records of types the registry does not serve are skipped rather than
/// treated as errors; an undecodable message is a malformed response.
pub fn decode_answers(
    msg: &Message<Bytes>,
) -> Result<Vec<StoredRecord>, UpstreamError> {
    let answer = msg.answer().map_err(|_| UpstreamError::Malformed)?;
    let mut records = Vec::new();
    for record in answer.limit_to::<RegistryRecordData<_, _>>() {
        let record = match record {
            Ok(record) => record,
            Err(_) => return Err(UpstreamError::Malformed),
        };
        let owner = record
            .owner()
            .try_to_name::<Bytes>()
            .map_err(|_| UpstreamError::Malformed)?;
        let data = record
            .data()
            .to_stored()
            .map_err(|_| UpstreamError::Malformed)?;
        records.push(StoredRecord::new(
            owner,
            record.class(),
            record.ttl(),
            data,
        ));
    }
    Ok(records)
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;
    use domain::base::iana::{Class, Rcode};
    use domain::rdata::A;
    use std::str::FromStr;

    #[test]
    fn decode_skips_foreign_record_types() {
        let name = StoredName::from_str("k.validators.realm").unwrap();
        let mut builder = MessageBuilder::new_vec()
            .start_answer(
                &MessageBuilder::new_vec().into_message(),
                Rcode::NOERROR,
            )
            .unwrap();
        builder
            .push((
                &name,
                Class::IN,
                Ttl::from_secs(60),
                A::new("1.2.3.4".parse().unwrap()),
            ))
            .unwrap();
        builder
            .push((
                &name,
                Class::IN,
                Ttl::from_secs(60),
                domain::rdata::Mx::new(
                    10,
                    StoredName::from_str("mail.example").unwrap(),
                ),
            ))
            .unwrap();
        let bytes = builder.into_message().into_octets();
        let msg = Message::from_octets(Bytes::from(bytes)).unwrap();

        let records = decode_answers(&msg).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rtype(), Rtype::A);
    }
}
