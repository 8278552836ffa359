//! Xtreme Playback - command line companion
//!
//! Resolves stream URLs, probes streams through the same transport and media
//! cache a playback session uses, and shows saved watch progress.

// Use mimalloc for faster memory allocation (Linux, macOS)
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{error, info};

use xtreme_playback::cache::{self, CacheStore};
use xtreme_playback::library::{JsonLibrary, LibraryStore};
use xtreme_playback::progress::format_speed;
use xtreme_playback::transport::{data_source_for, BandwidthMeter, ByteRange, DataSource, HttpDataSource};
use xtreme_playback::{classify, resolve, AppConfig, ContentKind, PlaybackFailure, PlaybackRequest};

/// Default probe size: 512KB
const PROBE_BYTES: u64 = 512 * 1024;

#[derive(Parser, Debug)]
#[command(name = "xtreme-playback")]
#[command(version, about = "Resolve, probe and inspect Xtream Codes streams")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the stream URL a session would play
    Resolve {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Read the start of a stream through the transport and media cache
    Probe {
        #[command(flatten)]
        source: SourceArgs,

        /// Number of bytes to read
        #[arg(long, default_value_t = PROBE_BYTES, value_parser = clap::value_parser!(u64).range(1..))]
        bytes: u64,
    },

    /// Show the saved watch progress of a movie or episode
    Progress {
        /// Content id
        id: i64,

        #[arg(value_enum)]
        kind: Kind,
    },
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Play this URI as-is instead of building an Xtream stream URL
    #[arg(long, conflicts_with_all = ["server", "username", "password", "id", "kind", "extension"])]
    url: Option<String>,

    /// Xtream server base URL
    #[arg(required_unless_present = "url")]
    server: Option<String>,

    #[arg(required_unless_present = "url")]
    username: Option<String>,

    #[arg(required_unless_present = "url")]
    password: Option<String>,

    /// Stream, movie or episode id
    #[arg(required_unless_present = "url")]
    id: Option<i64>,

    #[arg(value_enum, required_unless_present = "url")]
    kind: Option<Kind>,

    /// Container extension for movies and episodes
    extension: Option<String>,
}

impl SourceArgs {
    fn request(&self) -> Result<PlaybackRequest, String> {
        if let Some(uri) = &self.url {
            return Ok(PlaybackRequest::direct(uri));
        }
        let (Some(server), Some(username), Some(password), Some(id), Some(kind)) =
            (&self.server, &self.username, &self.password, self.id, self.kind)
        else {
            return Err("either --url or <SERVER> <USERNAME> <PASSWORD> <ID> <KIND> is required".to_string());
        };
        let mut request = PlaybackRequest::xtream(server, username, password, id, kind.into());
        if let Some(extension) = &self.extension {
            request = request.with_extension(extension);
        }
        Ok(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Kind {
    Live,
    #[value(alias = "movie")]
    Vod,
    Series,
}

impl From<Kind> for ContentKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Live => ContentKind::Live,
            Kind::Vod => ContentKind::Vod,
            Kind::Series => ContentKind::Series,
        }
    }
}

fn cmd_resolve(source: &SourceArgs) -> Result<(), String> {
    let request = source.request()?;
    let source = resolve(&request).map_err(|e| e.to_string())?;
    println!("{}", source);
    Ok(())
}

fn cmd_probe(config: &AppConfig, source: &SourceArgs, bytes: u64) -> Result<(), String> {
    let request = source.request()?;
    let source = resolve(&request).map_err(|e| e.to_string())?;
    let range = ByteRange::new(0, bytes);

    let meter = BandwidthMeter::new();
    let upstream: Arc<dyn DataSource> = Arc::new(HttpDataSource::new(config.http(), meter.clone()));
    let disk_cache = if request.kind.is_live() {
        None
    } else {
        match cache::shared(&config.cache_dir(), config.cache_capacity_bytes()) {
            Ok(cache) => {
                info!("Media cache: {} ({} MB used)", cache.dir().display(), cache.used_bytes() / (1024 * 1024));
                Some(cache)
            }
            Err(e) => {
                error!("Media cache unavailable: {}", e);
                None
            }
        }
    };
    let media_cache = disk_cache.clone().map(|cache| cache as Arc<dyn CacheStore>);
    let data_source = data_source_for(request.kind, upstream, media_cache);

    println!("Probing {} [{}]", source, range);
    let started = Instant::now();
    let result = data_source.read(source.as_str(), range);
    // The shared cache lives in a static and is never dropped
    if let Some(Err(e)) = disk_cache.map(|cache| cache.flush()) {
        error!("Could not save media cache index: {}", e);
    }
    match result {
        Ok(data) => {
            let elapsed_ms = started.elapsed().as_millis().max(1) as u64;
            let network = meter.total_bytes();
            println!("Read {} bytes in {} ms", data.len(), elapsed_ms);
            if network == 0 {
                println!("Served from the media cache");
            } else {
                println!("Network: {}", format_speed(network * 1000 / elapsed_ms));
            }
            Ok(())
        }
        Err(e) => {
            let report = classify(&PlaybackFailure::from(&e));
            Err(format!("{}: {}", report.title, report.user_message()))
        }
    }
}

fn cmd_progress(id: i64, kind: Kind) -> Result<(), String> {
    let kind = ContentKind::from(kind);

    let library = JsonLibrary::open(&JsonLibrary::default_path()).map_err(|e| e.to_string())?;
    match library.watch_record(id, kind).map_err(|e| e.to_string())? {
        Some(record) if record.finished => {
            println!("{} {}: finished, {} s watched", kind, id, record.watched_seconds);
        }
        Some(record) => {
            println!(
                "{} {}: resume at {} s of {} s, {} s watched (updated {})",
                kind,
                id,
                record.last_position_ms / 1000,
                record.max_duration_ms / 1000,
                record.watched_seconds,
                record.updated_at.format("%Y-%m-%d %H:%M")
            );
        }
        None => println!("{} {}: never played", kind, id),
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match &cli.command {
        Command::Resolve { source } => cmd_resolve(source),
        Command::Probe { source, bytes } => cmd_probe(&AppConfig::load(), source, *bytes),
        Command::Progress { id, kind } => cmd_progress(*id, *kind),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{}", message);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Result<Command, clap::Error> {
        let mut argv = vec!["xtreme-playback"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).map(|cli| cli.command)
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_xtream_probe() {
        let Command::Probe { source, bytes } = parse(&["probe", "http://h", "u", "p", "42", "movie", "mkv", "--bytes", "10"]).unwrap()
        else {
            panic!("expected probe");
        };
        assert_eq!(bytes, 10);
        let request = source.request().unwrap();
        assert_eq!(request.content_id, Some(42));
        assert_eq!(request.kind, ContentKind::Vod);
        assert_eq!(request.extension, "mkv");
    }

    #[test]
    fn test_read_size_defaults() {
        let Command::Probe { bytes, .. } = parse(&["probe", "--url", "http://cdn/a.ts"]).unwrap() else {
            panic!("expected probe");
        };
        assert_eq!(bytes, PROBE_BYTES);
        assert!(parse(&["probe", "--url", "http://cdn/a.ts", "--bytes"]).is_err());
        assert!(parse(&["probe", "--url", "http://cdn/a.ts", "--bytes", "lots"]).is_err());
        assert!(parse(&["probe", "--url", "http://cdn/a.ts", "--bytes", "0"]).is_err());
    }

    #[test]
    fn test_parse_direct_request() {
        let Command::Resolve { source } = parse(&["resolve", "--url", "http://cdn/a.m3u8"]).unwrap() else {
            panic!("expected resolve");
        };
        let request = source.request().unwrap();
        assert_eq!(request.direct_uri.as_deref(), Some("http://cdn/a.m3u8"));
    }

    #[test]
    fn test_rejects_bad_arguments() {
        assert!(parse(&["resolve", "http://h", "u"]).is_err());
        assert!(parse(&["resolve", "http://h", "u", "p", "x", "vod"]).is_err());
        assert!(parse(&["resolve", "http://h", "u", "p", "1", "radio"]).is_err());
        assert!(parse(&["resolve", "--url", "http://cdn/a.ts", "http://h"]).is_err());
        assert!(parse(&["progress", "7"]).is_err());
        assert!(matches!(parse(&["progress", "7", "series"]).unwrap(), Command::Progress { id: 7, kind: Kind::Series }));
    }
}
