use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use skaldi_core::config::Config;
use skaldi_core::types::Track;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;
use url::Url;

const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("resolver tool failed: {0}")]
    Tool(String),
    #[error("no tracks found")]
    NoTracks,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw per-line output of the resolver tool.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTrack {
    id: String,
    title: String,
    artist: String,
    duration: f64,
    uploader: String,
    thumbnail: String,
    webpage_url: String,
    url: String,
    ie_key: String,
}

/// Search output sometimes arrives as one wrapper object instead of lines.
#[derive(Debug, Deserialize)]
struct PlaylistWrapper {
    entries: Vec<RawTrack>,
}

/// Turns URLs and search queries into track descriptors by driving the
/// generated yt-dlp shim.
pub struct Resolver {
    cfg: Arc<Config>,
}

impl Resolver {
    pub fn new(cfg: Arc<Config>) -> Self {
        Self { cfg }
    }

    /// Resolve a URL (single track or playlist) into track descriptors.
    pub async fn resolve(&self, uri: &str) -> Result<Vec<Track>, ResolveError> {
        let output = Command::new(self.cfg.shim_path())
            .args([
                "--dump-json",
                "--flat-playlist",
                "--no-download",
                "--no-warnings",
                uri,
            ])
            .output()
            .await?;

        if !output.status.success() {
            return Err(ResolveError::Tool(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        parse_lines(&output.stdout)
    }

    /// Run a music-tab search and a plain search concurrently and merge,
    /// music results first, deduplicated by video id. `source = "music"`
    /// returns only the music results when there are any.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        source: &str,
    ) -> Result<Vec<Track>, ResolveError> {
        let music_uri = music_search_uri(query);
        let plain_uri = format!("ytsearch{limit}:{query}");

        let (music, plain) = tokio::join!(
            tokio::time::timeout(SEARCH_TIMEOUT, self.search_one(&music_uri, limit)),
            tokio::time::timeout(SEARCH_TIMEOUT, self.search_one(&plain_uri, 0)),
        );

        let mut music = match music {
            Ok(Ok(tracks)) => tracks,
            Ok(Err(e)) => {
                debug!(error = %e, "music search failed");
                Vec::new()
            }
            Err(_) => {
                debug!("music search timed out");
                Vec::new()
            }
        };
        for track in &mut music {
            track.is_music = true;
        }

        let plain = match plain {
            Ok(Ok(tracks)) => tracks,
            Ok(Err(e)) => {
                debug!(error = %e, "plain search failed");
                Vec::new()
            }
            Err(_) => {
                debug!("plain search timed out");
                Vec::new()
            }
        };

        if music.is_empty() && plain.is_empty() {
            return Err(ResolveError::NoTracks);
        }
        if source == "music" && !music.is_empty() {
            return Ok(music);
        }
        Ok(dedup(music, plain))
    }

    async fn search_one(&self, uri: &str, limit: usize) -> Result<Vec<Track>, ResolveError> {
        let mut args = vec!["--dump-json", "--no-download", "--no-warnings"];
        let limit_arg = limit.to_string();
        if limit > 0 {
            args.extend(["--playlist-end", limit_arg.as_str()]);
        }
        args.push(uri);

        let output = Command::new(self.cfg.shim_path()).args(&args).output().await?;

        if !output.stdout.is_empty() {
            if let Ok(wrapper) = serde_json::from_slice::<PlaylistWrapper>(&output.stdout) {
                if !wrapper.entries.is_empty() {
                    return Ok(raw_to_tracks(wrapper.entries));
                }
            }
            if let Ok(tracks) = parse_lines(&output.stdout) {
                return Ok(tracks);
            }
        }

        if !output.status.success() {
            return Err(ResolveError::Tool(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Err(ResolveError::NoTracks)
    }
}

fn music_search_uri(query: &str) -> String {
    let mut uri = Url::parse("https://music.youtube.com/search").expect("static url");
    uri.query_pairs_mut().append_pair("q", query);
    uri.set_fragment(Some("songs"));
    uri.to_string()
}

fn parse_lines(data: &[u8]) -> Result<Vec<Track>, ResolveError> {
    let text = String::from_utf8_lossy(data);
    let tracks: Vec<Track> = text
        .lines()
        .filter_map(|line| serde_json::from_str::<RawTrack>(line).ok())
        .map(Track::from)
        .filter(|t| !t.webpage_url.is_empty())
        .collect();

    if tracks.is_empty() {
        return Err(ResolveError::NoTracks);
    }
    Ok(tracks)
}

fn raw_to_tracks(entries: Vec<RawTrack>) -> Vec<Track> {
    entries
        .into_iter()
        .map(Track::from)
        .filter(|t| !t.webpage_url.is_empty())
        .collect()
}

impl From<RawTrack> for Track {
    fn from(raw: RawTrack) -> Self {
        let artist = if raw.artist.is_empty() {
            raw.uploader.clone()
        } else {
            raw.artist
        };

        // Flat playlist entries for YouTube often carry only the video id.
        let webpage_url = if raw.webpage_url.is_empty() && !raw.id.is_empty() && raw.ie_key == "Youtube"
        {
            format!("https://www.youtube.com/watch?v={}", raw.id)
        } else {
            raw.webpage_url
        };

        Track {
            title: raw.title,
            artist,
            duration: raw.duration,
            uploader: raw.uploader,
            thumbnail: raw.thumbnail,
            url: raw.url,
            webpage_url,
            is_music: false,
        }
    }
}

/// Merge two result lists, primary first, dropping secondary entries whose
/// video id already appeared.
fn dedup(primary: Vec<Track>, secondary: Vec<Track>) -> Vec<Track> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(primary.len() + secondary.len());

    for track in primary {
        if let Some(id) = video_id(&track.webpage_url) {
            seen.insert(id);
        }
        out.push(track);
    }
    for track in secondary {
        if let Some(id) = video_id(&track.webpage_url) {
            if !seen.insert(id) {
                continue;
            }
        }
        out.push(track);
    }
    out
}

fn video_id(uri: &str) -> Option<String> {
    if uri.is_empty() {
        return None;
    }
    let parsed = Url::parse(uri).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == "v")
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_lines_reads_one_object_per_line() {
        let data = concat!(
            r#"{"title":"T1","artist":"A1","duration":100.0,"webpage_url":"https://ex/t1"}"#,
            "\n",
            r#"{"title":"T2","uploader":"U2","duration":200.0,"webpage_url":"https://ex/t2"}"#,
            "\n",
            "not json\n",
        );

        let tracks = parse_lines(data.as_bytes()).unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].title, "T1");
        assert_eq!(tracks[0].artist, "A1");
        assert_eq!(tracks[1].title, "T2");
        // artist falls back to uploader
        assert_eq!(tracks[1].artist, "U2");
    }

    #[test]
    fn parse_lines_skips_entries_without_webpage_url() {
        let data = r#"{"title":"No URL"}"#;
        assert!(matches!(
            parse_lines(data.as_bytes()),
            Err(ResolveError::NoTracks)
        ));
    }

    #[test]
    fn bare_youtube_ids_reconstruct_the_watch_url() {
        let raw = RawTrack {
            id: "abc123".into(),
            title: "T".into(),
            ie_key: "Youtube".into(),
            ..Default::default()
        };
        let track = Track::from(raw);
        assert_eq!(track.webpage_url, "https://www.youtube.com/watch?v=abc123");
    }

    #[test]
    fn non_youtube_ids_are_not_reconstructed() {
        let raw = RawTrack {
            id: "xyz".into(),
            title: "T".into(),
            ie_key: "Soundcloud".into(),
            ..Default::default()
        };
        let track = Track::from(raw);
        assert!(track.webpage_url.is_empty());
    }

    #[test]
    fn dedup_drops_repeated_video_ids() {
        let make = |id: &str| Track {
            title: id.to_string(),
            webpage_url: format!("https://www.youtube.com/watch?v={id}"),
            ..Default::default()
        };

        let primary = vec![make("a"), make("b")];
        let secondary = vec![make("b"), make("c")];
        let merged = dedup(primary, secondary);

        let titles: Vec<&str> = merged.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, ["a", "b", "c"]);
    }

    #[test]
    fn dedup_keeps_tracks_without_video_ids() {
        let no_id = Track {
            title: "direct".into(),
            webpage_url: "https://example.com/stream.mp3".into(),
            ..Default::default()
        };
        let merged = dedup(vec![no_id.clone()], vec![no_id]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn music_search_uri_escapes_query() {
        let uri = music_search_uri("hello world & more");
        assert!(uri.starts_with("https://music.youtube.com/search?q="));
        assert!(uri.ends_with("#songs"));
        assert!(!uri.contains(' '));
    }

    #[test]
    fn video_id_extraction() {
        assert_eq!(
            video_id("https://www.youtube.com/watch?v=abc&t=10"),
            Some("abc".to_string())
        );
        assert_eq!(video_id("https://example.com/no-id"), None);
        assert_eq!(video_id(""), None);
    }
}
