// src/instruments/network.rs
//
// =============================================================================
// SUNBENCH: NETWORK BACKEND
// =============================================================================
//
// Real instruments reachable over a TCP line link (LAN serial servers,
// the controller board, SCPI sockets).
//
// Changes from the virtual path:
// - Every query is bounded by the acquisition timeout.
// - SMU and light-engine wire drivers are not linked into this crate.

use super::{
    ControllerBoard, HardwareBackend, Instrument, InstrumentKind, LightEngine, Monochromator,
    ScpiProbe, SmuLink, SourceMeter,
};
use crate::error::{LabError, LabResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Strips an optional `socket://` or `tcp://` scheme.
fn socket_addr(address: &str) -> &str {
    address
        .strip_prefix("socket://")
        .or_else(|| address.strip_prefix("tcp://"))
        .unwrap_or(address)
}

// ============================================================================
// 1. THE LINE LINK
// ============================================================================

/// One request line out, one reply line back.
pub struct LineLink {
    kind: InstrumentKind,
    address: String,
    reader: BufReader<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
    timeout: Duration,
}

impl LineLink {
    pub async fn open(kind: InstrumentKind, address: &str, timeout: Duration) -> LabResult<Self> {
        let stream = TcpStream::connect(socket_addr(address))
            .await
            .map_err(|e| LabError::connect(kind, address, e))?;
        let (read_half, write_half) = stream.into_split();
        log::debug!("Opened {} link to {}", kind, address);
        Ok(Self {
            kind,
            address: address.to_string(),
            reader: BufReader::new(read_half),
            writer: Some(write_half),
            timeout,
        })
    }

    pub async fn query(&mut self, cmd: &str) -> LabResult<String> {
        let kind = self.kind;
        let timeout = self.timeout;
        let reader = &mut self.reader;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| LabError::instrument(kind, "link closed"))?;
        let exchange = async {
            writer.write_all(cmd.as_bytes()).await?;
            writer.write_all(b"\r\n").await?;
            writer.flush().await?;
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed the link",
                ));
            }
            Ok::<_, std::io::Error>(line.trim_end().to_string())
        };
        let reason = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(reply)) => return Ok(reply),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no reply within {:?}", timeout),
        };
        // A late reply would answer the next query; the link is spent
        self.close();
        Err(LabError::instrument(kind, format!("'{}': {}", cmd, reason)))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Drops the write half; the socket closes once both halves are gone.
    pub fn close(&mut self) {
        if self.writer.take().is_some() {
            log::debug!("Closed {} link to {}", self.kind, self.address);
        }
    }
}

// ============================================================================
// 2. LINE-LINKED INSTRUMENTS
// ============================================================================

/// A line link speaking as one instrument kind.
pub struct LinkedInstrument {
    link: LineLink,
    kind: InstrumentKind,
}

impl Instrument for LinkedInstrument {
    fn kind(&self) -> InstrumentKind {
        self.kind
    }

    fn address(&self) -> &str {
        self.link.address()
    }

    fn release(&mut self) {
        self.link.close();
    }
}

#[async_trait]
impl ControllerBoard for LinkedInstrument {
    async fn query(&mut self, cmd: &str) -> LabResult<String> {
        self.link.query(cmd).await
    }
}

#[async_trait]
impl Monochromator for LinkedInstrument {
    async fn command(&mut self, cmd: &str) -> LabResult<String> {
        self.link.query(cmd).await
    }
}

#[async_trait]
impl ScpiProbe for LinkedInstrument {
    async fn query(&mut self, cmd: &str) -> LabResult<String> {
        self.link.query(cmd).await
    }
}

// ============================================================================
// 3. THE BACKEND
// ============================================================================

/// Default hardware backend.
pub struct NetworkBackend;

impl NetworkBackend {
    async fn linked(
        kind: InstrumentKind,
        address: &str,
        timeout: Duration,
    ) -> LabResult<LinkedInstrument> {
        Ok(LinkedInstrument {
            link: LineLink::open(kind, address, timeout).await?,
            kind,
        })
    }
}

#[async_trait]
impl HardwareBackend for NetworkBackend {
    async fn board(&self, address: &str, timeout: Duration) -> LabResult<Box<dyn ControllerBoard>> {
        let board = Self::linked(InstrumentKind::StageController, address, timeout).await?;
        Ok(Box::new(board))
    }

    async fn smu(&self, link: &SmuLink, _timeout: Duration) -> LabResult<Box<dyn SourceMeter>> {
        Err(LabError::connect(
            InstrumentKind::Smu,
            &link.address,
            "no hardware driver linked",
        ))
    }

    async fn light_engine(
        &self,
        address: &str,
        _recipe: &str,
        _timeout: Duration,
    ) -> LabResult<Box<dyn LightEngine>> {
        Err(LabError::connect(
            InstrumentKind::LightEngine,
            address,
            "no hardware driver linked",
        ))
    }

    async fn monochromator(
        &self,
        address: &str,
        timeout: Duration,
    ) -> LabResult<Box<dyn Monochromator>> {
        let mono = Self::linked(InstrumentKind::Monochromator, address, timeout).await?;
        Ok(Box::new(mono))
    }

    async fn scpi(
        &self,
        kind: InstrumentKind,
        address: &str,
        timeout: Duration,
    ) -> LabResult<Box<dyn ScpiProbe>> {
        Ok(Box::new(Self::linked(kind, address, timeout).await?))
    }
}
