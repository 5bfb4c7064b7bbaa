//! Wire types shared by the filter agent and filter plugins.
//!
//! Every hook request and every decision travels as a [`FilterMessage`], a
//! fixed-width record. The frame tag tells which hook it belongs to and the
//! payload length must always equal [`FILTER_MESSAGE_SIZE`].
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::FilterError;

/// Correlation key of one SMTP transaction, assigned by the front-end.
pub type SessionId = u64;

pub const FILTER_API_VERSION: u32 = 1;

/// Reply code substituted for anything a plugin passes outside `[400, 600)`.
pub const DEFAULT_REJECT_CODE: u32 = 530;

pub const STATUS_LINE_SIZE: usize = 512;
pub const HOSTNAME_SIZE: usize = 256;
pub const LOCALPART_SIZE: usize = 128;
pub const DOMAINPART_SIZE: usize = 256;
pub const LINE_SIZE: usize = 1024;

const SOCKADDR_SIZE: usize = 20;
const PAYLOAD_SIZE: usize = LINE_SIZE;

pub const FILTER_MESSAGE_SIZE: usize = 8 + 4 + 4 + STATUS_LINE_SIZE + PAYLOAD_SIZE;

const _: () = assert!(2 * SOCKADDR_SIZE + HOSTNAME_SIZE <= PAYLOAD_SIZE);
const _: () = assert!(LOCALPART_SIZE + DOMAINPART_SIZE <= PAYLOAD_SIZE);

/// Tag of the one-time registration announcement sent by a plugin.
pub const TAG_REGISTER: u32 = 1;
const HOOK_TAG_BASE: u32 = 16;

/// SMTP transaction stage subject to filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Connect,
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    DataLine,
    Quit,
    Close,
    Rset,
}

impl HookKind {
    pub const ALL: [HookKind; 9] = [
        HookKind::Connect,
        HookKind::Helo,
        HookKind::Ehlo,
        HookKind::Mail,
        HookKind::Rcpt,
        HookKind::DataLine,
        HookKind::Quit,
        HookKind::Close,
        HookKind::Rset,
    ];

    fn index(self) -> u32 {
        match self {
            HookKind::Connect => 0,
            HookKind::Helo => 1,
            HookKind::Ehlo => 2,
            HookKind::Mail => 3,
            HookKind::Rcpt => 4,
            HookKind::DataLine => 5,
            HookKind::Quit => 6,
            HookKind::Close => 7,
            HookKind::Rset => 8,
        }
    }

    /// Frame tag used for requests and decisions of this hook.
    pub fn tag(self) -> u32 {
        HOOK_TAG_BASE + self.index()
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        tag.checked_sub(HOOK_TAG_BASE)
            .and_then(|i| Self::ALL.get(i as usize).copied())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HookKind::Connect => "CONNECT",
            HookKind::Helo => "HELO",
            HookKind::Ehlo => "EHLO",
            HookKind::Mail => "MAIL",
            HookKind::Rcpt => "RCPT",
            HookKind::DataLine => "DATALINE",
            HookKind::Quit => "QUIT",
            HookKind::Close => "CLOSE",
            HookKind::Rset => "RSET",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of hooks a plugin asked to receive. Bit `n` is the `n`th hook kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookMask(u32);

impl HookMask {
    const VALID: u32 = (1 << HookKind::ALL.len()) - 1;

    pub const fn empty() -> Self {
        HookMask(0)
    }

    pub fn insert(&mut self, kind: HookKind) {
        self.0 |= 1 << kind.index();
    }

    pub fn contains(self, kind: HookKind) -> bool {
        self.0 & (1 << kind.index()) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        (bits & !Self::VALID == 0).then_some(HookMask(bits))
    }

    pub fn iter(self) -> impl Iterator<Item = HookKind> {
        HookKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }

    /// Payload of the registration message.
    pub fn encode(self) -> Bytes {
        Bytes::copy_from_slice(&self.0.to_be_bytes())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FilterError> {
        let bytes: [u8; 4] = payload
            .try_into()
            .map_err(|_| FilterError::CorruptedMessage {
                tag: TAG_REGISTER,
                expected: 4,
                actual: payload.len(),
            })?;
        let bits = u32::from_be_bytes(bytes);
        Self::from_bits(bits).ok_or(FilterError::InvalidMask(bits))
    }
}

impl FromIterator<HookKind> for HookMask {
    fn from_iter<I: IntoIterator<Item = HookKind>>(iter: I) -> Self {
        let mut mask = HookMask::empty();
        for kind in iter {
            mask.insert(kind);
        }
        mask
    }
}

/// Mailbox split into its local and domain parts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailAddress {
    pub user: String,
    pub domain: String,
}

impl MailAddress {
    pub fn new(user: impl Into<String>, domain: impl Into<String>) -> Self {
        MailAddress {
            user: user.into(),
            domain: domain.into(),
        }
    }

    /// Splits at the last `@`. Without one, the whole input is the local part.
    pub fn parse(addr: &str) -> Self {
        match addr.rsplit_once('@') {
            Some((user, domain)) => MailAddress::new(user, domain),
            None => MailAddress::new(addr, ""),
        }
    }

    /// True for the `MAIL FROM:<>` null sender.
    pub fn is_null(&self) -> bool {
        self.user.is_empty() && self.domain.is_empty()
    }
}

impl fmt::Display for MailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.domain.is_empty() {
            f.write_str(&self.user)
        } else {
            write!(f, "{}@{}", self.user, self.domain)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectInfo {
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub hostname: String,
}

/// Stage-specific content of a hook request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookPayload {
    Connect(ConnectInfo),
    Helo(String),
    Ehlo(String),
    Mail(MailAddress),
    Rcpt(MailAddress),
    DataLine(String),
    Quit,
    Close,
    Rset,
}

impl HookPayload {
    pub fn kind(&self) -> HookKind {
        match self {
            HookPayload::Connect(_) => HookKind::Connect,
            HookPayload::Helo(_) => HookKind::Helo,
            HookPayload::Ehlo(_) => HookKind::Ehlo,
            HookPayload::Mail(_) => HookKind::Mail,
            HookPayload::Rcpt(_) => HookKind::Rcpt,
            HookPayload::DataLine(_) => HookKind::DataLine,
            HookPayload::Quit => HookKind::Quit,
            HookPayload::Close => HookKind::Close,
            HookPayload::Rset => HookKind::Rset,
        }
    }
}

/// Fixed-width record carried by every hook request and decision.
///
/// A request has `code == 0` and an empty status line; the decision echoes
/// the request with `code` set to 0 (accept) or a reject code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterMessage {
    pub id: SessionId,
    pub version: u32,
    pub code: u32,
    pub status_line: String,
    pub payload: HookPayload,
}

impl FilterMessage {
    pub fn request(id: SessionId, payload: HookPayload) -> Self {
        FilterMessage {
            id,
            version: FILTER_API_VERSION,
            code: 0,
            status_line: String::new(),
            payload,
        }
    }

    pub fn kind(&self) -> HookKind {
        self.payload.kind()
    }

    pub fn is_accept(&self) -> bool {
        self.code == 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FILTER_MESSAGE_SIZE);
        buf.put_u64(self.id);
        buf.put_u32(self.version);
        buf.put_u32(self.code);
        put_fixed(&mut buf, &self.status_line, STATUS_LINE_SIZE);

        let start = buf.len();
        match &self.payload {
            HookPayload::Connect(info) => {
                put_sockaddr(&mut buf, info.local);
                put_sockaddr(&mut buf, info.remote);
                put_fixed(&mut buf, &info.hostname, HOSTNAME_SIZE);
            }
            HookPayload::Helo(host) | HookPayload::Ehlo(host) => {
                put_fixed(&mut buf, host, HOSTNAME_SIZE);
            }
            HookPayload::Mail(addr) | HookPayload::Rcpt(addr) => {
                put_fixed(&mut buf, &addr.user, LOCALPART_SIZE);
                put_fixed(&mut buf, &addr.domain, DOMAINPART_SIZE);
            }
            HookPayload::DataLine(line) => {
                put_fixed(&mut buf, line, LINE_SIZE);
            }
            HookPayload::Quit | HookPayload::Close | HookPayload::Rset => {}
        }
        let used = buf.len() - start;
        buf.put_bytes(0, PAYLOAD_SIZE - used);

        debug_assert_eq!(buf.len(), FILTER_MESSAGE_SIZE);
        buf.freeze()
    }

    pub fn decode(kind: HookKind, payload: &[u8]) -> Result<Self, FilterError> {
        if payload.len() != FILTER_MESSAGE_SIZE {
            return Err(FilterError::CorruptedMessage {
                tag: kind.tag(),
                expected: FILTER_MESSAGE_SIZE,
                actual: payload.len(),
            });
        }

        let mut buf = payload;
        let id = buf.get_u64();
        let version = buf.get_u32();
        if version != FILTER_API_VERSION {
            return Err(FilterError::VersionMismatch {
                expected: FILTER_API_VERSION,
                found: version,
            });
        }
        let code = buf.get_u32();
        let status_line = get_fixed(&mut buf, STATUS_LINE_SIZE);

        let payload = match kind {
            HookKind::Connect => {
                let local = get_sockaddr(&mut buf);
                let remote = get_sockaddr(&mut buf);
                let hostname = get_fixed(&mut buf, HOSTNAME_SIZE);
                HookPayload::Connect(ConnectInfo {
                    local,
                    remote,
                    hostname,
                })
            }
            HookKind::Helo => HookPayload::Helo(get_fixed(&mut buf, HOSTNAME_SIZE)),
            HookKind::Ehlo => HookPayload::Ehlo(get_fixed(&mut buf, HOSTNAME_SIZE)),
            HookKind::Mail => HookPayload::Mail(get_mailaddr(&mut buf)),
            HookKind::Rcpt => HookPayload::Rcpt(get_mailaddr(&mut buf)),
            HookKind::DataLine => HookPayload::DataLine(get_fixed(&mut buf, LINE_SIZE)),
            HookKind::Quit => HookPayload::Quit,
            HookKind::Close => HookPayload::Close,
            HookKind::Rset => HookPayload::Rset,
        };

        Ok(FilterMessage {
            id,
            version,
            code,
            status_line,
            payload,
        })
    }
}

/// Maps a plugin supplied reject code onto a valid SMTP failure reply.
pub fn clamp_reject_code(code: u32) -> u32 {
    if (400..600).contains(&code) {
        code
    } else {
        DEFAULT_REJECT_CODE
    }
}

/// Cuts `line` to what fits the status line field. The flag reports whether
/// anything was dropped.
pub fn fit_status_line(line: &str) -> (&str, bool) {
    truncate_at_boundary(line, STATUS_LINE_SIZE - 1)
}

fn truncate_at_boundary(s: &str, max: usize) -> (&str, bool) {
    if s.len() <= max {
        return (s, false);
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    (&s[..end], true)
}

// Always leaves at least one NUL in the field.
fn put_fixed(buf: &mut BytesMut, s: &str, size: usize) {
    let (s, _) = truncate_at_boundary(s, size - 1);
    buf.put_slice(s.as_bytes());
    buf.put_bytes(0, size - s.len());
}

fn get_fixed(buf: &mut &[u8], size: usize) -> String {
    let data: &[u8] = *buf;
    let field = &data[..size];
    let end = memchr::memchr(0, field).unwrap_or(size);
    let s = String::from_utf8_lossy(&field[..end]).into_owned();
    buf.advance(size);
    s
}

fn get_mailaddr(buf: &mut &[u8]) -> MailAddress {
    let user = get_fixed(buf, LOCALPART_SIZE);
    let domain = get_fixed(buf, DOMAINPART_SIZE);
    MailAddress { user, domain }
}

fn put_sockaddr(buf: &mut BytesMut, addr: Option<SocketAddr>) {
    match addr {
        None => buf.put_bytes(0, SOCKADDR_SIZE),
        Some(SocketAddr::V4(a)) => {
            buf.put_u8(4);
            buf.put_u8(0);
            buf.put_u16(a.port());
            buf.put_slice(&a.ip().octets());
            buf.put_bytes(0, 12);
        }
        Some(SocketAddr::V6(a)) => {
            buf.put_u8(6);
            buf.put_u8(0);
            buf.put_u16(a.port());
            buf.put_slice(&a.ip().octets());
        }
    }
}

fn get_sockaddr(buf: &mut &[u8]) -> Option<SocketAddr> {
    let family = buf.get_u8();
    buf.advance(1);
    let port = buf.get_u16();
    let mut octets = [0u8; 16];
    buf.copy_to_slice(&mut octets);
    match family {
        4 => {
            let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        6 => Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
        _ => None,
    }
}
