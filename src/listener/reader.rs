//! Background reader thread.
//!
//! ```text
//! WaitingForClient ──accept──► Connected ──┐
//!        │                        ▲        │ header → validate → sniff IP → emit
//!        │                        └────────┘
//!        └────────── cancel / EOF / error ──────► Closed
//! ```
//!
//! Every blocking call is either bounded by the poll interval or woken by the
//! socket shutdown that `stop()` performs, and the cancellation token is
//! checked at each wake-up.

use std::any::Any;
use std::cell::Cell;
use std::io::{self, Read};
use std::net::Shutdown;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::stats::ListenerStats;
use super::Shared;
use crate::constants::{IP_SNIFF_LEN, RECORD_HEADER_SIZE};
use crate::error::{ReaderError, StreamError};
use crate::event::PacketEvent;
use crate::sink::EventSink;
use crate::socket::framing::{derive_protocol, RecordHeader, RecordLayout};
use crate::socket::poll::{poll_readable, Readiness};
use crate::socket::server::ServerSocket;
use crate::socket::stream::StreamReader;

thread_local! {
    /// `Shared` of the listener whose reader loop runs on this thread.
    static READER_OWNER: Cell<*const Shared> = const { Cell::new(ptr::null()) };
}

/// Whether the caller is the reader thread of the listener owning `shared`
/// (i.e. inside that listener's event sink).
///
/// The reader keeps its `Arc<Shared>` alive for as long as the thread runs,
/// so the address cannot be reused by another listener in the meantime.
pub(crate) fn is_reader_thread_of(shared: &Arc<Shared>) -> bool {
    READER_OWNER.with(|owner| ptr::eq(owner.get(), Arc::as_ptr(shared)))
}

/// Everything the reader thread owns.
pub(crate) struct ReaderContext {
    pub(crate) server: Arc<ServerSocket>,
    pub(crate) shared: Arc<Shared>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) cancel: CancellationToken,
    pub(crate) poll_interval: Duration,
}

/// Thread entry point. Returns when the loop reaches `Closed`.
pub(crate) fn run(ctx: ReaderContext) {
    READER_OWNER.with(|owner| owner.set(Arc::as_ptr(&ctx.shared)));
    let _alive = scopeguard::guard(Arc::clone(&ctx.shared), |shared| {
        shared.alive.store(false, Ordering::Release);
    });
    log::info!(
        "[reader] waiting for producer on {}",
        ctx.server.path().display()
    );

    let exit = match accept_client(&ctx) {
        Ok(stream) => serve_client(&ctx, stream),
        Err(e) => e,
    };

    if exit.is_cancelled() {
        log::info!("[reader] stopped");
    } else if exit.is_disconnect() {
        log::info!("[reader] producer disconnected: {exit}");
    } else {
        log::error!("[reader] loop terminated: {exit:#}");
    }

    // One client per listener lifetime: stop accepting once it is gone.
    if let Some(server) = ctx.shared.server.take_if_same(&ctx.server) {
        server.shutdown();
    }
}

/// Wait for the producer, re-polling every `poll_interval`.
fn accept_client(ctx: &ReaderContext) -> Result<UnixStream, ReaderError> {
    loop {
        if ctx.cancel.is_cancelled() {
            return Err(StreamError::Cancelled.into());
        }
        match poll_readable(ctx.server.as_raw_fd(), ctx.poll_interval) {
            Ok(Readiness::Readable) => {}
            Ok(Readiness::TimedOut) => continue,
            Ok(Readiness::Hangup(revents)) => {
                return Err(cancelled_or(&ctx.cancel, ReaderError::Hangup(revents)))
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(cancelled_or(&ctx.cancel, ReaderError::Poll(e))),
        }

        if ctx.cancel.is_cancelled() {
            return Err(StreamError::Cancelled.into());
        }
        match ctx.server.accept() {
            Ok(stream) => return Ok(stream),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) => {}
            Err(e) => return Err(cancelled_or(&ctx.cancel, ReaderError::Accept(e))),
        }
    }
}

/// Read records from the connected producer until the loop terminates.
fn serve_client(ctx: &ReaderContext, stream: UnixStream) -> ReaderError {
    if let Err(e) = stream.set_read_timeout(Some(ctx.poll_interval)) {
        log::warn!("[reader] could not set read timeout: {e}");
    }

    let client = Arc::new(stream);
    if let Some(previous) = ctx.shared.client.put(Arc::clone(&client)) {
        shutdown_client(&previous);
    }
    let _release = scopeguard::guard(Arc::clone(&client), |client| {
        if let Some(client) = ctx.shared.client.take_if_same(&client) {
            shutdown_client(&client);
        }
    });
    ctx.shared.stats.connection_accepted();
    log::info!("[reader] producer connected (fd {})", client.as_raw_fd());

    let fd = client.as_raw_fd();
    let mut reader = StreamReader::new(&*client, ctx.cancel.clone());
    loop {
        if ctx.cancel.is_cancelled() {
            return StreamError::Cancelled.into();
        }
        match poll_readable(fd, ctx.poll_interval) {
            Ok(Readiness::Readable) => {}
            Ok(Readiness::TimedOut) => continue,
            Ok(Readiness::Hangup(revents)) => {
                return cancelled_or(&ctx.cancel, ReaderError::Hangup(revents))
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return cancelled_or(&ctx.cancel, ReaderError::Poll(e)),
        }

        let before = reader.consumed();
        let outcome = read_record(&mut reader, &ctx.shared.stats);
        ctx.shared.stats.add_bytes(reader.consumed() - before);

        match outcome {
            Ok(Some(event)) => emit(ctx, &event),
            Ok(None) => {}
            Err(e) => return e,
        }
    }
}

/// Frame one record off the stream.
///
/// Consumes exactly `RECORD_HEADER_SIZE + frame_length` bytes on success.
/// Returns `Ok(None)` for records that produce no event (empty or
/// malformed frames).
pub(crate) fn read_record<R: Read>(
    reader: &mut StreamReader<R>,
    stats: &ListenerStats,
) -> Result<Option<PacketEvent>, ReaderError> {
    let mut raw = [0u8; RECORD_HEADER_SIZE];
    reader.read_exact(&mut raw)?;
    let header = RecordHeader::decode(&raw);
    stats.record_read(header.drop_count);

    let (link_offset, ip_length) = match header.layout() {
        RecordLayout::Empty => {
            log::trace!("[reader] empty frame from uid {}", header.subject_id);
            return Ok(None);
        }
        RecordLayout::Skip { length, reason } => {
            log::warn!(
                "[reader] dropping record from uid {}: {reason}",
                header.subject_id
            );
            stats.framing_error();
            reader.discard_exact(length)?;
            return Ok(None);
        }
        RecordLayout::Packet {
            link_offset,
            ip_length,
        } => (link_offset, ip_length),
    };

    reader.discard_exact(link_offset)?;

    let mut sniff = [0u8; IP_SNIFF_LEN];
    let sniffed = ip_length.min(IP_SNIFF_LEN);
    reader.read_exact(&mut sniff[..sniffed])?;
    let protocol = derive_protocol(&sniff[..sniffed]);

    let remainder = ip_length.checked_sub(sniffed).ok_or_else(|| {
        ReaderError::Invariant(format!(
            "sniffed {sniffed} bytes of a {ip_length}-byte IP payload"
        ))
    })?;
    reader.discard_exact(remainder)?;

    Ok(Some(PacketEvent::new(&header, ip_length, protocol)))
}

/// Hand one event to the sink. Errors and panics are logged and counted.
fn emit(ctx: &ReaderContext, event: &PacketEvent) {
    let stats = &ctx.shared.stats;
    stats.event_emitted();
    match panic::catch_unwind(AssertUnwindSafe(|| ctx.sink.on_packet(event))) {
        Ok(Ok(())) => log::trace!("[reader] emitted {event:?}"),
        Ok(Err(e)) => {
            stats.sink_failed();
            log::warn!("[reader] event sink failed: {e:#}");
        }
        Err(payload) => {
            stats.sink_failed();
            log::error!("[reader] event sink panicked: {}", panic_message(&*payload));
        }
    }
}

/// Shut a client socket down in both directions.
///
/// `ENOTCONN` is expected once the producer has already gone.
pub(crate) fn shutdown_client(client: &UnixStream) {
    if let Err(e) = client.shutdown(Shutdown::Both) {
        log::debug!("[reader] client shutdown: {e}");
    }
}

/// Report cancellation instead of `err` once `stop()` has been requested;
/// the socket shutdown it performs surfaces as arbitrary errors.
fn cancelled_or(cancel: &CancellationToken, err: ReaderError) -> ReaderError {
    if cancel.is_cancelled() {
        StreamError::Cancelled.into()
    } else {
        err
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::framing::{link_type, FLAG_TX};
    use std::io::Cursor;

    fn record(header: &RecordHeader, payload: &[u8]) -> Vec<u8> {
        assert_eq!(header.frame_length as usize, payload.len());
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    fn header(link: i32, frame_length: u32) -> RecordHeader {
        RecordHeader {
            subject_id: 10_123,
            frame_length,
            link_type: link,
            ..RecordHeader::default()
        }
    }

    /// 14-byte Ethernet header + IPv4 header (TCP) + 20 bytes of payload.
    fn ethernet_tcp_frame() -> Vec<u8> {
        let mut frame = vec![0u8; 14];
        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        ip[9] = 6;
        frame.extend_from_slice(&ip);
        frame.extend_from_slice(&[0xEE; 20]);
        frame
    }

    fn reader_over(bytes: Vec<u8>) -> StreamReader<Cursor<Vec<u8>>> {
        StreamReader::new(Cursor::new(bytes), CancellationToken::new())
    }

    #[test]
    fn test_ethernet_tcp_record() {
        let mut hdr = header(link_type::ETHERNET, 54);
        hdr.flags = FLAG_TX;
        let bytes = record(&hdr, &ethernet_tcp_frame());
        let mut reader = reader_over(bytes);
        let stats = ListenerStats::default();

        let event = read_record(&mut reader, &stats).unwrap().unwrap();
        assert_eq!(event.ip_payload_length, 40);
        assert_eq!(event.protocol_code, 6);
        assert!(event.is_uplink);
        assert_eq!(event.frame_length, 54);
        assert_eq!(reader.consumed(), 40 + 54);
    }

    #[test]
    fn test_each_record_consumes_header_plus_frame() {
        let mut bytes = Vec::new();
        let lengths = [1u32, 19, 20, 21, 300, 5000];
        for &len in &lengths {
            bytes.extend(record(&header(link_type::RAW, len), &vec![0x60; len as usize]));
        }
        let mut reader = reader_over(bytes);
        let stats = ListenerStats::default();

        let mut expected = 0u64;
        for &len in &lengths {
            let event = read_record(&mut reader, &stats).unwrap().unwrap();
            expected += 40 + u64::from(len);
            assert_eq!(reader.consumed(), expected);
            assert_eq!(event.ip_payload_length, i64::from(len));
        }
    }

    #[test]
    fn test_zero_length_consumes_only_header() {
        let mut bytes = header(link_type::ETHERNET, 0).encode().to_vec();
        bytes.extend(record(&header(link_type::RAW, 1), &[0x45]));
        let mut reader = reader_over(bytes);
        let stats = ListenerStats::default();

        assert!(read_record(&mut reader, &stats).unwrap().is_none());
        assert_eq!(reader.consumed(), 40);
        assert!(read_record(&mut reader, &stats).unwrap().is_some());
        assert_eq!(stats.snapshot().framing_errors, 0);
    }

    #[test]
    fn test_oversize_frame_is_skipped_and_stream_stays_aligned() {
        let big = 70_000u32;
        let mut bytes = record(&header(link_type::RAW, big), &vec![0xFF; big as usize]);
        bytes.extend(record(&header(link_type::ETHERNET, 54), &ethernet_tcp_frame()));
        let mut reader = reader_over(bytes);
        let stats = ListenerStats::default();

        assert!(read_record(&mut reader, &stats).unwrap().is_none());
        assert_eq!(reader.consumed(), 40 + u64::from(big));
        let event = read_record(&mut reader, &stats).unwrap().unwrap();
        assert_eq!(event.protocol_code, 6);
        assert_eq!(stats.snapshot().framing_errors, 1);
        assert_eq!(stats.snapshot().records, 2);
    }

    #[test]
    fn test_frame_shorter_than_link_header_is_skipped() {
        let mut bytes = record(&header(link_type::LINUX_SLL2, 8), &[0u8; 8]);
        bytes.extend(record(&header(link_type::RAW, 1), &[0x45]));
        let mut reader = reader_over(bytes);
        let stats = ListenerStats::default();

        assert!(read_record(&mut reader, &stats).unwrap().is_none());
        assert_eq!(reader.consumed(), 48);
        assert!(read_record(&mut reader, &stats).unwrap().is_some());
    }

    #[test]
    fn test_frame_equal_to_link_header_has_empty_ip_payload() {
        let bytes = record(&header(link_type::LINUX_SLL, 16), &[0u8; 16]);
        let mut reader = reader_over(bytes);
        let event = read_record(&mut reader, &ListenerStats::default())
            .unwrap()
            .unwrap();
        assert_eq!(event.ip_payload_length, 0);
        assert_eq!(event.protocol_code, 0);
    }

    #[test]
    fn test_unknown_link_type_treated_as_raw() {
        let mut ip = vec![0u8; 40];
        ip[0] = 0x60;
        ip[6] = 17;
        let bytes = record(&header(9999, 40), &ip);
        let mut reader = reader_over(bytes);
        let event = read_record(&mut reader, &ListenerStats::default())
            .unwrap()
            .unwrap();
        assert_eq!(event.ip_payload_length, 40);
        assert_eq!(event.protocol_code, 17);
    }

    #[test]
    fn test_truncated_payload_is_stream_error() {
        let mut bytes = header(link_type::ETHERNET, 54).encode().to_vec();
        bytes.extend_from_slice(&[0u8; 10]);
        let mut reader = reader_over(bytes);
        match read_record(&mut reader, &ListenerStats::default()) {
            Err(e) => assert!(e.is_disconnect(), "unexpected error: {e:?}"),
            other => panic!("Expected disconnect, got: {other:?}"),
        }
    }

    #[test]
    fn test_empty_stream_is_disconnect() {
        let mut reader = reader_over(Vec::new());
        let err = read_record(&mut reader, &ListenerStats::default()).unwrap_err();
        assert!(err.is_disconnect());
    }

    #[test]
    fn test_panic_message_extracts_strings() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*payload), "<non-string panic payload>");
    }

    #[test]
    fn test_reader_owner_defaults_to_none() {
        let shared = Arc::new(Shared::default());
        assert!(!is_reader_thread_of(&shared));
    }

    #[test]
    fn test_reader_owner_matches_only_its_listener() {
        let mine = Arc::new(Shared::default());
        let other = Arc::new(Shared::default());
        let mine_in_thread = Arc::clone(&mine);
        let other_in_thread = Arc::clone(&other);
        std::thread::spawn(move || {
            READER_OWNER.with(|owner| owner.set(Arc::as_ptr(&mine_in_thread)));
            assert!(is_reader_thread_of(&mine_in_thread));
            assert!(!is_reader_thread_of(&other_in_thread));
        })
        .join()
        .unwrap();
        assert!(!is_reader_thread_of(&mine));
        assert!(!is_reader_thread_of(&other));
    }

    #[test]
    fn test_shutdown_client_tolerates_closed_peer() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        shutdown_client(&a);
        shutdown_client(&a);
    }
}
