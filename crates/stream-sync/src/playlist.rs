//! Live HLS playlist follower.
//!
//! [`SegmentReader`] turns a live media playlist into one continuous byte stream:
//! segments are fetched in media-sequence order and the playlist is re-fetched when the
//! reader runs out of known segments. A master playlist is resolved to its highest
//! bandwidth variant first.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::decode_loop::StopSignal;
use crate::profile::SourceProfile;

/// Segments taken from the end of the first playlist load.
const LIVE_EDGE_SEGMENTS: usize = 3;

#[derive(Clone, Debug, PartialEq)]
pub struct MediaPlaylist {
    pub media_sequence: u64,
    pub target_duration: Duration,
    /// Segment URIs as written in the playlist, in order.
    pub segments: Vec<String>,
    /// `#EXT-X-ENDLIST` seen; no more segments will appear.
    pub ended: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Variant {
    pub bandwidth: u64,
    pub uri: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Playlist {
    Master(Vec<Variant>),
    Media(MediaPlaylist),
}

/// Parse an M3U8 document.
pub fn parse_playlist(text: &str) -> Result<Playlist, String> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    match lines.next() {
        Some("#EXTM3U") => {}
        _ => return Err("missing #EXTM3U header".to_string()),
    }

    let mut media = MediaPlaylist {
        media_sequence: 0,
        target_duration: Duration::from_secs(2),
        segments: Vec::new(),
        ended: false,
    };
    let mut variants = Vec::new();
    let mut pending_bandwidth: Option<u64> = None;

    for line in lines {
        if let Some(v) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            media.media_sequence = v.trim().parse().map_err(|_| format!("bad media sequence: {v}"))?;
        } else if let Some(v) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            let secs: f64 = v.trim().parse().map_err(|_| format!("bad target duration: {v}"))?;
            media.target_duration = Duration::from_secs_f64(secs.clamp(0.1, 60.0));
        } else if line == "#EXT-X-ENDLIST" {
            media.ended = true;
        } else if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            pending_bandwidth = Some(attribute(attrs, "BANDWIDTH").and_then(|b| b.parse().ok()).unwrap_or(0));
        } else if line.starts_with('#') {
            continue;
        } else if let Some(bandwidth) = pending_bandwidth.take() {
            variants.push(Variant {
                bandwidth,
                uri: line.to_string(),
            });
        } else {
            media.segments.push(line.to_string());
        }
    }

    if variants.is_empty() {
        Ok(Playlist::Media(media))
    } else {
        Ok(Playlist::Master(variants))
    }
}

/// Value of `name` in an attribute list like `BANDWIDTH=1280000,CODECS="mp4a.40.2"`.
fn attribute<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    attrs.split(',').find_map(|kv| {
        let (k, v) = kv.split_once('=')?;
        (k.trim() == name).then(|| v.trim().trim_matches('"'))
    })
}

/// Resolve a playlist entry against the playlist URL.
pub fn resolve_url(base: &str, reference: &str) -> String {
    if reference.contains("://") {
        return reference.to_string();
    }
    let base = base.split(['?', '#']).next().unwrap_or(base);
    if let Some(rest) = reference.strip_prefix('/') {
        let origin_end = base
            .find("://")
            .and_then(|i| base[i + 3..].find('/').map(|j| i + 3 + j))
            .unwrap_or(base.len());
        return format!("{}/{}", &base[..origin_end], rest);
    }
    match base.rfind('/') {
        Some(i) if i > base.find("://").map_or(0, |s| s + 2) => format!("{}{}", &base[..=i], reference),
        _ => format!("{base}/{reference}"),
    }
}

/// File extension of a URL path, lowercased, if any.
pub fn url_extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
}

pub(crate) fn http_get(url: &str, timeout: Duration) -> io::Result<ureq::http::Response<ureq::Body>> {
    ureq::get(url)
        .config()
        .timeout_connect(Some(timeout))
        .timeout_recv_response(Some(timeout))
        .build()
        .call()
        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, format!("GET {url}: {e}")))
}

fn fetch_text(url: &str, timeout: Duration) -> io::Result<String> {
    http_get(url, timeout)?
        .into_body()
        .read_to_string()
        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, format!("read {url}: {e}")))
}

fn stopped() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "playlist reader stopped")
}

/// Byte stream over the segments of a live media playlist.
///
/// Waits between playlist refreshes end as soon as the session's stop signal is raised.
pub struct SegmentReader {
    playlist_url: String,
    stop: Arc<StopSignal>,
    read_timeout: Duration,
    playlist_timeout: Duration,
    read_ahead: usize,
    next_sequence: Option<u64>,
    queued: VecDeque<String>,
    current: Option<Box<dyn Read + Send>>,
    target_duration: Duration,
    ended: bool,
    segment_extension: Option<String>,
}

impl SegmentReader {
    /// Load the playlist (following a master playlist to one variant).
    pub fn open(url: &str, profile: &SourceProfile, stop: Arc<StopSignal>) -> io::Result<Self> {
        let mut playlist_url = url.to_string();
        let mut text = fetch_text(&playlist_url, profile.read_timeout)?;
        if let Ok(Playlist::Master(variants)) = parse_playlist(&text) {
            let best = variants
                .iter()
                .max_by_key(|v| v.bandwidth)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "master playlist has no variants"))?;
            playlist_url = resolve_url(url, &best.uri);
            tracing::info!(variant = %playlist_url, bandwidth = best.bandwidth, "selected playlist variant");
            text = fetch_text(&playlist_url, profile.read_timeout)?;
        }

        let mut reader = Self {
            playlist_url,
            stop,
            read_timeout: profile.read_timeout,
            playlist_timeout: profile.playlist_timeout.max(Duration::from_millis(500)),
            read_ahead: profile.read_ahead_segments.max(1),
            next_sequence: None,
            queued: VecDeque::new(),
            current: None,
            target_duration: Duration::from_secs(2),
            ended: false,
            segment_extension: None,
        };
        reader.apply(&text)?;
        reader.segment_extension = reader.queued.front().and_then(|u| url_extension(u));
        Ok(reader)
    }

    /// Extension of the first segment, used as a demuxer hint.
    pub fn segment_extension(&self) -> Option<&str> {
        self.segment_extension.as_deref()
    }

    /// Merge a fresh playlist. Returns how many new segments were queued.
    fn apply(&mut self, text: &str) -> io::Result<usize> {
        let media = match parse_playlist(text) {
            Ok(Playlist::Media(m)) => m,
            Ok(Playlist::Master(_)) => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "nested master playlist"));
            }
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        };
        self.target_duration = media.target_duration;
        self.ended = media.ended;
        let (added, next) = plan_segments(&media, self.next_sequence, self.read_ahead);
        if let Some(expected) = self.next_sequence {
            if media.media_sequence > expected {
                tracing::warn!(
                    expected,
                    first = media.media_sequence,
                    "playlist moved past unread segments"
                );
            }
        }
        for uri in &added {
            self.queued.push_back(resolve_url(&self.playlist_url, uri));
        }
        self.next_sequence = Some(next);
        Ok(added.len())
    }

    /// Re-fetch the playlist until it grows, it ends, or the playlist timeout passes.
    fn refresh(&mut self) -> io::Result<bool> {
        let deadline = Instant::now() + self.playlist_timeout;
        loop {
            let text = fetch_text(&self.playlist_url, self.read_timeout)?;
            if self.apply(&text)? > 0 {
                return Ok(true);
            }
            if self.ended {
                return Ok(false);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "live playlist stopped advancing"));
            }
            let wait = (self.target_duration / 2).min(deadline - now);
            if self.stop.wait(wait) {
                return Err(stopped());
            }
        }
    }

    fn open_next(&mut self) -> io::Result<bool> {
        if self.stop.is_stopped() {
            return Err(stopped());
        }
        if self.queued.is_empty() && !self.refresh()? {
            return Ok(false);
        }
        let Some(url) = self.queued.pop_front() else {
            return Ok(false);
        };
        tracing::debug!(segment = %url, "fetching segment");
        let body = http_get(&url, self.read_timeout)?.into_body().into_reader();
        self.current = Some(Box::new(body));
        Ok(true)
    }
}

impl Read for SegmentReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.stop.is_stopped() {
                return Err(stopped());
            }
            if let Some(segment) = self.current.as_mut() {
                let n = segment.read(out)?;
                if n > 0 {
                    return Ok(n);
                }
                self.current = None;
            }
            if !self.open_next()? {
                return Ok(0);
            }
        }
    }
}

/// Pick the segments to queue from `media` given the next expected sequence number.
///
/// On the first load only the live edge is taken. Returns the URIs and the sequence
/// number following the last one.
fn plan_segments(media: &MediaPlaylist, next: Option<u64>, read_ahead: usize) -> (Vec<String>, u64) {
    let first = media.media_sequence;
    let end = first + media.segments.len() as u64;
    let start = match next {
        Some(n) => n.clamp(first, end),
        None => end.saturating_sub(LIVE_EDGE_SEGMENTS.min(read_ahead) as u64).max(first),
    };
    let skip = (start - first) as usize;
    let take: Vec<String> = media.segments.iter().skip(skip).take(read_ahead).cloned().collect();
    let next = start + take.len() as u64;
    (take, next)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVE: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:100\n#EXTINF:4.0,\nseg100.aac\n#EXTINF:4.0,\nseg101.aac\n#EXTINF:4.0,\nseg102.aac\n#EXTINF:4.0,\nseg103.aac\n";

    fn media(text: &str) -> MediaPlaylist {
        match parse_playlist(text).unwrap() {
            Playlist::Media(m) => m,
            Playlist::Master(_) => panic!("expected media playlist"),
        }
    }

    #[test]
    fn parses_media_playlist() {
        let m = media(LIVE);
        assert_eq!(m.media_sequence, 100);
        assert_eq!(m.target_duration, Duration::from_secs(4));
        assert_eq!(m.segments.len(), 4);
        assert_eq!(m.segments[0], "seg100.aac");
        assert!(!m.ended);
    }

    #[test]
    fn parses_master_playlist() {
        let text = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=64000,CODECS=\"mp4a.40.2\"\nlow/index.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=128000\nhigh/index.m3u8\n";
        let Playlist::Master(variants) = parse_playlist(text).unwrap() else {
            panic!("expected master playlist");
        };
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[1].bandwidth, 128_000);
        assert_eq!(variants[1].uri, "high/index.m3u8");
    }

    #[test]
    fn rejects_non_playlist() {
        assert!(parse_playlist("<html>").is_err());
    }

    #[test]
    fn endlist_is_detected() {
        let m = media("#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:0\nseg0.ts\n#EXT-X-ENDLIST\n");
        assert!(m.ended);
    }

    #[test]
    fn first_load_starts_at_live_edge() {
        let m = media(LIVE);
        let (take, next) = plan_segments(&m, None, 8);
        assert_eq!(take, vec!["seg101.aac", "seg102.aac", "seg103.aac"]);
        assert_eq!(next, 104);
    }

    #[test]
    fn refresh_queues_only_new_segments() {
        let m = media(LIVE);
        let (take, next) = plan_segments(&m, Some(103), 8);
        assert_eq!(take, vec!["seg103.aac"]);
        assert_eq!(next, 104);

        let (take, next) = plan_segments(&m, Some(104), 8);
        assert!(take.is_empty());
        assert_eq!(next, 104);
    }

    #[test]
    fn expired_segments_resume_at_window_start() {
        let m = media(LIVE);
        let (take, next) = plan_segments(&m, Some(90), 2);
        assert_eq!(take, vec!["seg100.aac", "seg101.aac"]);
        assert_eq!(next, 102);
    }

    #[test]
    fn resolves_relative_and_absolute_references() {
        let base = "https://cdn.example/live/chan/index.m3u8?token=1";
        assert_eq!(resolve_url(base, "seg1.aac"), "https://cdn.example/live/chan/seg1.aac");
        assert_eq!(resolve_url(base, "/other/seg1.aac"), "https://cdn.example/other/seg1.aac");
        assert_eq!(resolve_url(base, "http://b.example/x.aac"), "http://b.example/x.aac");
    }

    /// Serve `body` to every request until the listener is dropped with the test.
    fn serve_playlist(body: &'static str) -> String {
        use std::io::Write;
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = write!(
                    stream,
                    "HTTP/1.1 200 OK\r\nContent-Type: application/vnd.apple.mpegurl\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
            }
        });
        format!("http://{addr}/live/index.m3u8")
    }

    #[test]
    fn stop_interrupts_refresh_wait() {
        // a 20 s target duration makes each refresh wait 10 s
        const STALLED: &str = "#EXTM3U\n#EXT-X-TARGETDURATION:20\n#EXT-X-MEDIA-SEQUENCE:7\nseg7.aac\n";
        let url = serve_playlist(STALLED);
        let profile = SourceProfile {
            read_timeout: Duration::from_secs(2),
            playlist_timeout: Duration::from_secs(30),
            ..SourceProfile::for_kind(stream_sync_types::StreamKind::Segmented)
        };
        let stop = StopSignal::new();
        let mut reader = SegmentReader::open(&url, &profile, stop.clone()).unwrap();
        reader.queued.clear();

        let started = Instant::now();
        let refresh = std::thread::spawn(move || reader.refresh());
        std::thread::sleep(Duration::from_millis(200));
        stop.stop();

        let err = refresh.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }

    #[test]
    fn url_extension_ignores_query() {
        assert_eq!(url_extension("http://x/a/seg1.AAC?t=1").as_deref(), Some("aac"));
        assert_eq!(url_extension("http://x/a/stream").as_deref(), None);
    }
}
