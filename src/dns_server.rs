/* src/dns_server.rs */

use crate::config::NameServerConfig;
use crate::resolver::DnsResolver;
use crate::stats::{Stats, meter_query};
use crate::transfer::{ENVELOPE_QUEUE_DEPTH, transfer_zone};
use crate::tsig::Authenticator;
use fancy_log::{LogLevel, log};
use hickory_proto::ProtoError;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{self, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Largest UDP datagram we read; EDNS clients may send more than 512.
const UDP_RECV_BUF: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// A zone transfer accepted on TCP, waiting to be streamed.
pub struct TransferRequest {
    request: Message,
    query: Query,
    request_mac: Option<Vec<u8>>,
}

/// What the transport should do with one inbound message.
pub enum Outcome {
    Reply(Vec<u8>),
    Transfer(TransferRequest),
    /// Send nothing.
    Drop,
}

/// MAC chaining state for the messages of one signed reply.
#[derive(Clone)]
struct MacChain {
    previous: Vec<u8>,
    first: bool,
}

/// The protocol-agnostic request handler shared by both listeners.
pub struct QueryHandler {
    resolver: Arc<DnsResolver>,
    stats: Arc<dyn Stats>,
    config: Arc<NameServerConfig>,
    auth: Option<Authenticator>,
}

impl QueryHandler {
    pub fn new(
        resolver: Arc<DnsResolver>,
        stats: Arc<dyn Stats>,
        config: Arc<NameServerConfig>,
        auth: Option<Authenticator>,
    ) -> Self {
        Self {
            resolver,
            stats,
            config,
            auth,
        }
    }

    pub async fn handle(&self, data: &[u8], addr: SocketAddr, transport: Transport) -> Outcome {
        let request = match Message::from_bytes(data) {
            Ok(req) => req,
            Err(e) => {
                log(
                    LogLevel::Warn,
                    &format!("Failed to parse request from {}: {}", addr, e),
                );
                return Outcome::Drop;
            }
        };

        if request.message_type() != MessageType::Query {
            return Outcome::Drop;
        }

        let signed = request
            .signature()
            .iter()
            .any(|record| record.record_type() == RecordType::TSIG);
        let request_mac = match &self.auth {
            Some(auth) if signed => match auth.verify_request(data, unix_now()) {
                Ok(mac) => Some(mac),
                Err(e) => {
                    log(
                        LogLevel::Warn,
                        &format!("Dropping request {} from {}: {}", request.id(), addr, e),
                    );
                    return Outcome::Drop;
                }
            },
            _ => None,
        };
        let mut chain = request_mac.clone().map(|previous| MacChain {
            previous,
            first: true,
        });

        let mut response = response_to(&request);

        if request.op_code() != OpCode::Query {
            if let Some(query) = request.queries().first() {
                meter_query(self.stats.as_ref(), &query.query_type().to_string());
            }
            response.set_response_code(ResponseCode::NotImp);
            return self.reply(&response, chain.as_mut());
        }

        let query = match request.queries().first() {
            Some(q) => q.clone(),
            None => {
                response.set_response_code(ResponseCode::FormErr);
                return self.reply(&response, chain.as_mut());
            }
        };

        log(
            LogLevel::Info,
            &format!("{} query {} {}", addr, query.name(), query.query_type()),
        );
        meter_query(self.stats.as_ref(), &query.query_type().to_string());

        if matches!(query.query_type(), RecordType::AXFR | RecordType::IXFR) {
            if transport == Transport::Udp {
                response.set_response_code(ResponseCode::Refused);
                return self.reply(&response, chain.as_mut());
            }
            return Outcome::Transfer(TransferRequest {
                request,
                query,
                request_mac,
            });
        }

        match self.resolver.resolve(&query).await {
            Ok(answers) => {
                log(
                    LogLevel::Info,
                    &format!(
                        "{} inquiry {} get {}",
                        addr.ip(),
                        query.name(),
                        format_records(&answers)
                    ),
                );
                response.add_answers(answers);
            }
            Err(e) if e.is_store_failure() => {
                log(LogLevel::Error, &format!("Store failure: {}", e));
                response.set_response_code(ResponseCode::ServFail);
            }
            Err(e) => {
                log(LogLevel::Debug, &format!("No answer: {}", e));
            }
        }

        if transport == Transport::Udp {
            // Measure the reply as sent, TSIG included.
            let limit = usize::from(request.max_payload());
            let mut trial = chain.clone();
            match self.seal(&response, trial.as_mut()) {
                Some(bytes) if bytes.len() <= limit => return Outcome::Reply(bytes),
                Some(_) => {
                    let mut truncated = response_to(&request);
                    truncated.set_response_code(response.response_code());
                    truncated.set_truncated(true);
                    return self.reply(&truncated, chain.as_mut());
                }
                None => return Outcome::Drop,
            }
        }

        self.reply(&response, chain.as_mut())
    }

    /// Writes every envelope of a transfer as its own framed message, then
    /// shuts the stream down. The whole transfer is encoded and signed
    /// before the first write, so a failure anywhere sends nothing.
    pub async fn stream_transfer<W>(&self, stream: &mut W, transfer: TransferRequest) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let zone = transfer.query.name().to_string();
        log(LogLevel::Info, &format!("Starting transfer of {}", zone));

        match self.seal_transfer(transfer).await {
            Ok(frames) => {
                for frame in &frames {
                    write_frame(stream, frame).await?;
                }
                log(
                    LogLevel::Info,
                    &format!("Finished transfer of {} in {} envelope(s)", zone, frames.len()),
                );
            }
            Err(reason) => log(
                LogLevel::Error,
                &format!("Transfer of {} aborted: {}", zone, reason),
            ),
        }
        stream.shutdown().await
    }

    async fn seal_transfer(&self, transfer: TransferRequest) -> Result<Vec<Vec<u8>>, String> {
        let (tx, mut rx) = mpsc::channel(ENVELOPE_QUEUE_DEPTH);
        let resolver = self.resolver.clone();
        let query = transfer.query.clone();
        let producer = tokio::spawn(async move { transfer_zone(&resolver, &query, tx).await });

        let mut chain = transfer.request_mac.map(|previous| MacChain {
            previous,
            first: true,
        });
        let mut frames = Vec::new();
        let mut sealing = Ok(());
        while let Some(envelope) = rx.recv().await {
            let mut message = response_to(&transfer.request);
            message.add_answers(envelope);
            match self.seal(&message, chain.as_mut()) {
                Some(bytes) if bytes.len() <= usize::from(u16::MAX) => frames.push(bytes),
                Some(bytes) => {
                    sealing = Err(format!("envelope of {} bytes exceeds TCP framing", bytes.len()));
                    break;
                }
                None => {
                    sealing = Err("envelope could not be encoded".to_string());
                    break;
                }
            }
        }
        drop(rx);

        match producer.await {
            Ok(Ok(())) => sealing.map(|()| frames),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("transfer task failed: {}", e)),
        }
    }

    fn reply(&self, response: &Message, chain: Option<&mut MacChain>) -> Outcome {
        match self.seal(response, chain) {
            Some(bytes) => Outcome::Reply(bytes),
            None => Outcome::Drop,
        }
    }

    /// Encodes and, for signed exchanges, signs one outbound message.
    fn seal(&self, response: &Message, chain: Option<&mut MacChain>) -> Option<Vec<u8>> {
        if self.config.log_query {
            log(LogLevel::Debug, &format!("Response: {}", response));
        }
        let bytes = match self.encode(response) {
            Ok(bytes) => bytes,
            Err(e) => {
                log(
                    LogLevel::Error,
                    &format!("Failed to encode response {}: {}", response.id(), e),
                );
                return None;
            }
        };
        let (Some(auth), Some(chain)) = (&self.auth, chain) else {
            return Some(bytes);
        };
        match auth.sign_response(bytes, &chain.previous, chain.first, unix_now()) {
            Ok((signed, mac)) => {
                chain.previous = mac;
                chain.first = false;
                Some(signed)
            }
            Err(e) => {
                log(
                    LogLevel::Error,
                    &format!("Failed to sign response {}: {}", response.id(), e),
                );
                None
            }
        }
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, ProtoError> {
        let mut buf = Vec::with_capacity(512);
        let mut encoder = BinEncoder::new(&mut buf);
        encoder.set_canonical_names(!self.config.compress_query);
        message.emit(&mut encoder)?;
        Ok(buf)
    }
}

/// Runs both the UDP and TCP DNS servers concurrently. Failing to bind
/// either one is fatal.
pub async fn run_server(
    config: Arc<NameServerConfig>,
    handler: Arc<QueryHandler>,
) -> Result<(), Box<dyn std::error::Error>> {
    let bind_addr = config.listen_addr();
    let udp_socket = Arc::new(UdpSocket::bind(&bind_addr).await?);
    let tcp_listener = TcpListener::bind(&bind_addr).await?;

    log(
        LogLevel::Info,
        &format!("DNS server listening for UDP and TCP on {}", bind_addr),
    );

    let idle = Duration::from_secs(config.tcp_idle_timeout_secs);
    let udp = tokio::spawn(serve_udp(udp_socket, handler.clone()));
    let tcp = tokio::spawn(serve_tcp(tcp_listener, handler, idle));
    let (udp, tcp) = tokio::try_join!(udp, tcp)?;
    udp?;
    tcp?;
    Ok(())
}

async fn serve_udp(socket: Arc<UdpSocket>, handler: Arc<QueryHandler>) -> io::Result<()> {
    let mut udp_buf = vec![0u8; UDP_RECV_BUF];
    loop {
        let (len, addr) = match socket.recv_from(&mut udp_buf).await {
            Ok(received) => received,
            Err(e) => {
                log(LogLevel::Warn, &format!("UDP receive failed: {}", e));
                continue;
            }
        };
        let data = udp_buf[..len].to_vec();
        let handler = handler.clone();
        let socket = socket.clone();

        tokio::spawn(async move {
            if let Outcome::Reply(response_bytes) = handler.handle(&data, addr, Transport::Udp).await {
                if let Err(e) = socket.send_to(&response_bytes, addr).await {
                    log(
                        LogLevel::Error,
                        &format!("Failed to send UDP response to {}: {}", addr, e),
                    );
                }
            }
        });
    }
}

async fn serve_tcp(listener: TcpListener, handler: Arc<QueryHandler>, idle: Duration) -> io::Result<()> {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log(LogLevel::Warn, &format!("TCP accept failed: {}", e));
                continue;
            }
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_tcp_connection(stream, addr, handler, idle).await {
                log(
                    LogLevel::Warn,
                    &format!("TCP connection error from {}: {}", addr, e),
                );
            }
        });
    }
}

/// Serves length-prefixed messages until EOF, the idle timeout, or a zone
/// transfer, which takes the connection over and closes it.
async fn handle_tcp_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    handler: Arc<QueryHandler>,
    idle: Duration,
) -> io::Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        match timeout(idle, stream.read_exact(&mut len_buf)).await {
            Err(_) => return Ok(()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(_)) => {}
        }
        let len = u16::from_be_bytes(len_buf) as usize;

        let mut req_buf = vec![0u8; len];
        timeout(idle, stream.read_exact(&mut req_buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "request body timed out"))??;

        match handler.handle(&req_buf, addr, Transport::Tcp).await {
            Outcome::Reply(res_buf) => write_frame(&mut stream, &res_buf).await?,
            Outcome::Transfer(transfer) => {
                return handler.stream_transfer(&mut stream, transfer).await;
            }
            Outcome::Drop => {}
        }
    }
}

/// Writes one message with its two-byte length prefix.
async fn write_frame<W>(stream: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "message exceeds 65535 bytes"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await
}

/// An authoritative response skeleton echoing the request's question.
fn response_to(request: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_authoritative(true);
    response.add_queries(request.queries().iter().cloned());
    response
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Helper function to format DNS records into a concise string for logging.
fn format_records(records: &[Record]) -> String {
    let mut grouped = BTreeMap::<RecordType, Vec<String>>::new();

    for record in records {
        let value = match record.data() {
            RData::A(addr) => addr.to_string(),
            RData::AAAA(addr) => addr.to_string(),
            RData::CNAME(name) => name.to_string(),
            RData::MX(mx) => format!("{} {}", mx.preference(), mx.exchange()),
            RData::NS(name) => name.to_string(),
            RData::SOA(soa) => format!("{} {}", soa.mname(), soa.serial()),
            RData::SRV(srv) => format!(
                "{} {} {} {}",
                srv.priority(),
                srv.weight(),
                srv.port(),
                srv.target()
            ),
            RData::TXT(txt) => txt.to_string(),
            _ => continue,
        };
        grouped.entry(record.record_type()).or_default().push(value);
    }

    if grouped.is_empty() {
        return "[]".to_string();
    }

    grouped
        .iter()
        .map(|(rtype, vals)| format!("{} [{}]", rtype, vals.join(", ")))
        .collect::<Vec<_>>()
        .join(" ")
}
