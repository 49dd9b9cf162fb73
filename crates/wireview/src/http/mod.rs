//! Streaming HTTP/1.1 header parsing over captured bytes.
//!
//! The relay never reconstructs messages; it watches the raw byte stream
//! and needs just enough structure to find message boundaries and emit
//! capture records: start line, headers, and the three framing modes of
//! RFC 7230 (Content-Length, chunked, connection close).

pub mod state;

/// Tail window scanned for the terminal chunk marker.
const CHUNK_TAIL_WINDOW: usize = 64;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ParseError {
	#[error("malformed start line")]
	StartLine,

	#[error("unsupported http version")]
	Version,

	#[error("malformed status code")]
	Status,

	#[error("malformed header line")]
	Header,

	#[error("malformed content-length")]
	ContentLength,

	#[error("message buffer overflow")]
	Overflow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
	Http10,
	Http11,
}

impl Version {
	pub fn as_str(&self) -> &'static str {
		match self {
			Version::Http10 => "HTTP/1.0",
			Version::Http11 => "HTTP/1.1",
		}
	}

	fn parse(token: &str) -> Result<Self, ParseError> {
		match token {
			"HTTP/1.0" => Ok(Version::Http10),
			"HTTP/1.1" => Ok(Version::Http11),
			_ => Err(ParseError::Version),
		}
	}
}

/// Header list in wire order. Lookups are case-insensitive; duplicates are
/// preserved.
#[derive(Clone, Debug, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
	pub fn get(&self, name: &str) -> Option<&str> {
		self
			.0
			.iter()
			.find(|(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
		self
			.0
			.iter()
			.filter(move |(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
	}

	pub fn to_pairs(&self) -> Vec<(String, String)> {
		self.0.clone()
	}

	fn has_token(&self, name: &str, token: &str) -> bool {
		self.get_all(name).any(|v| {
			v.split(',')
				.any(|part| part.trim().eq_ignore_ascii_case(token))
		})
	}
}

#[derive(Clone, Debug)]
pub struct ParsedRequest {
	pub method: String,
	pub target: String,
	pub version: Version,
	pub headers: Headers,
	/// Offset of the first body byte (just past the blank line).
	pub header_end: usize,
	pub content_length: Option<u64>,
	pub is_chunked: bool,
	pub should_close: bool,
}

impl ParsedRequest {
	pub fn has_framing(&self) -> bool {
		self.content_length.is_some() || self.is_chunked
	}

	/// Total message size once framing is known.
	pub fn message_size(&self) -> Option<usize> {
		self.content_length.map(|l| self.header_end + l as usize)
	}
}

#[derive(Clone, Debug)]
pub struct ParsedResponse {
	pub status: u16,
	pub reason: String,
	pub version: Version,
	pub headers: Headers,
	pub header_end: usize,
	pub content_length: Option<u64>,
	pub is_chunked: bool,
	/// False where RFC 7230 §3.3 says no body follows: responses to HEAD
	/// and CONNECT, 1xx, 204, 304.
	pub has_body: bool,
	pub should_close: bool,
}

impl ParsedResponse {
	pub fn has_framing(&self) -> bool {
		self.content_length.is_some() || self.is_chunked
	}

	pub fn message_size(&self) -> Option<usize> {
		if !self.has_body {
			return Some(self.header_end);
		}
		self.content_length.map(|l| self.header_end + l as usize)
	}
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
	buf
		.windows(4)
		.position(|w| w == b"\r\n\r\n")
		.map(|i| i + 4)
}

fn parse_headers(lines: std::str::Split<'_, &str>) -> Result<Headers, ParseError> {
	let mut headers = Vec::new();
	for line in lines {
		if line.is_empty() {
			continue;
		}
		let (name, value) = line.split_once(':').ok_or(ParseError::Header)?;
		headers.push((name.trim().to_string(), value.trim().to_string()));
	}
	Ok(Headers(headers))
}

fn content_length(headers: &Headers) -> Result<Option<u64>, ParseError> {
	match headers.get("content-length") {
		Some(v) => v
			.trim()
			.parse::<u64>()
			.map(Some)
			.map_err(|_| ParseError::ContentLength),
		None => Ok(None),
	}
}

fn should_close(version: Version, headers: &Headers) -> bool {
	match version {
		Version::Http10 => !headers.has_token("connection", "keep-alive"),
		Version::Http11 => headers.has_token("connection", "close"),
	}
}

/// Parse a request head out of `buf`. Returns `Ok(None)` until the blank
/// line has arrived.
pub fn parse_request(buf: &[u8]) -> Result<Option<ParsedRequest>, ParseError> {
	let Some(header_end) = find_header_end(buf) else {
		return Ok(None);
	};
	let head = std::str::from_utf8(&buf[..header_end - 4]).map_err(|_| ParseError::Header)?;
	let mut lines = head.split("\r\n");
	let start = lines.next().ok_or(ParseError::StartLine)?;

	let mut parts = start.split(' ');
	let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
		(Some(m), Some(t), Some(v), None) if !m.is_empty() && !t.is_empty() => (m, t, v),
		_ => return Err(ParseError::StartLine),
	};
	let version = Version::parse(version)?;

	let headers = parse_headers(lines)?;
	let content_length = content_length(&headers)?;
	let is_chunked = headers.has_token("transfer-encoding", "chunked");
	let should_close = should_close(version, &headers);

	Ok(Some(ParsedRequest {
		method: method.to_string(),
		target: target.to_string(),
		version,
		headers,
		header_end,
		content_length,
		is_chunked,
		should_close,
	}))
}

/// Parse a response head. `request_method` is the method of the request
/// this response answers, needed for the no-body rules.
pub fn parse_response(
	buf: &[u8],
	request_method: Option<&str>,
) -> Result<Option<ParsedResponse>, ParseError> {
	let Some(header_end) = find_header_end(buf) else {
		return Ok(None);
	};
	let head = std::str::from_utf8(&buf[..header_end - 4]).map_err(|_| ParseError::Header)?;
	let mut lines = head.split("\r\n");
	let start = lines.next().ok_or(ParseError::StartLine)?;

	// Status line: version SP code [SP reason-with-spaces]
	let mut parts = start.splitn(3, ' ');
	let version = Version::parse(parts.next().ok_or(ParseError::StartLine)?)?;
	let status: u16 = parts
		.next()
		.ok_or(ParseError::StartLine)?
		.parse()
		.map_err(|_| ParseError::Status)?;
	if !(100..=599).contains(&status) {
		return Err(ParseError::Status);
	}
	let reason = parts.next().unwrap_or("").to_string();

	let headers = parse_headers(lines)?;
	let content_length = content_length(&headers)?;
	let is_chunked = headers.has_token("transfer-encoding", "chunked");

	let method_suppresses = matches!(request_method, Some(m) if m.eq_ignore_ascii_case("HEAD") || m.eq_ignore_ascii_case("CONNECT"));
	let has_body = !(method_suppresses || (100..200).contains(&status) || status == 204 || status == 304);

	Ok(Some(ParsedResponse {
		status,
		reason,
		version,
		should_close: should_close(version, &headers),
		header_end,
		content_length,
		is_chunked,
		has_body,
		headers,
	}))
}

/// Conservative completeness check for a chunked body: the terminal
/// `0\r\n\r\n` appears in the last 64 bytes. Trailer sections longer than
/// the window are not chased; this mirrors what the capture pipeline can
/// afford on a hot path.
pub fn is_chunked_body_complete(body: &[u8]) -> bool {
	let tail_start = body.len().saturating_sub(CHUNK_TAIL_WINDOW);
	body[tail_start..]
		.windows(5)
		.any(|w| w == b"0\r\n\r\n")
}

/// Decode as much chunked data as is available, for body previews.
/// Extensions after `;` are ignored; decoding stops at the zero chunk or
/// the first incomplete chunk.
pub fn decode_chunked(body: &[u8]) -> Vec<u8> {
	let mut out = Vec::new();
	let mut rest = body;
	loop {
		let Some(line_end) = rest.windows(2).position(|w| w == b"\r\n") else {
			return out;
		};
		let size_token = match std::str::from_utf8(&rest[..line_end]) {
			Ok(line) => line.split(';').next().unwrap_or("").trim(),
			Err(_) => return out,
		};
		let Ok(size) = usize::from_str_radix(size_token, 16) else {
			return out;
		};
		if size == 0 {
			return out;
		}
		let data_start = line_end + 2;
		let available = rest.len().saturating_sub(data_start).min(size);
		out.extend_from_slice(&rest[data_start..data_start + available]);
		if available < size {
			return out;
		}
		// Skip the chunk and its trailing CRLF.
		let next = data_start + size + 2;
		if next > rest.len() {
			return out;
		}
		rest = &rest[next..];
	}
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
