use anyhow::{Result, anyhow, bail};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;

use super::command::{Cli, ReportFormat, SeekArgs};
use crate::input::open_seekable;
use crate::timestamp::time_str;
use oggplay::player::host::{Host, Notification, ReaderTransport};
use oggplay::player::seek::SeekPath;
use oggplay::player::{PlaybackState, Player, PlayerOptions};
use oggplay::process::DecoderOptions;
use oggplay::process::decode::Decoder;

/// Events handled before a phase is given up.
const EVENT_LIMIT: usize = 1_000_000;

pub fn cmd_seek(args: &SeekArgs, cli: &Cli, multi: Option<&MultiProgress>) -> Result<()> {
    log::info!("Seeking {} to {:.3}s", args.input.display(), args.time);

    let reader = open_seekable(&args.input)?;
    let host = Host::new();
    let transport = ReaderTransport::new(reader, host.queue.clone());

    let decoder = Decoder::with_options(
        Box::new(oggplay::codec::null::NullBackend),
        DecoderOptions {
            fail_level: cli.fail_level(),
            ..Default::default()
        },
    );
    let options = PlayerOptions {
        probe_duration: args.probe_duration,
        read_chunk_size: args.chunk_size.max(1),
        ..Default::default()
    };
    let mut player = Player::new(decoder, host.collaborators(transport), options);

    let pb = match multi {
        Some(multi) => {
            let pb = multi.add(ProgressBar::new_spinner());
            pb.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
            pb.enable_steady_tick(std::time::Duration::from_millis(100));
            pb.set_message("Loading metadata...");
            Some(pb)
        }
        None => None,
    };

    player.load();
    let loaded = host.pump(&mut player, EVENT_LIMIT, |p| {
        p.state() == PlaybackState::Loaded || p.state() == PlaybackState::Ended
    })?;
    fail_on_error(&host)?;
    if !loaded || player.state() != PlaybackState::Loaded {
        bail!("Metadata did not load ({:?})", player.state());
    }

    if let Some(ref pb) = pb {
        pb.set_message(format!("Seeking to {}...", time_str(args.time)));
    }

    player.seek(args.time)?;
    let settled = host.pump(&mut player, EVENT_LIMIT, |p| !p.is_seeking())?;

    if let Some(ref pb) = pb {
        pb.finish_and_clear();
    }

    fail_on_error(&host)?;
    if !settled {
        bail!("Seek to {:.3}s did not settle", args.time);
    }

    let seek = player
        .last_seek()
        .cloned()
        .ok_or_else(|| anyhow!("Seek finished without a result"))?;

    let report = SeekOutcome {
        target: seek.target,
        path: match seek.path {
            SeekPath::Index => "index",
            SeekPath::Bisection => "bisection",
        },
        probes: seek.probes,
        frame_timestamp: seek.frame_timestamp,
        audio_timestamp: seek.audio_timestamp,
        duration: player.duration().filter(|d| d.is_finite()),
        bytes_total: player.byte_length(),
    };

    match args.format {
        ReportFormat::Text => report.display(),
        ReportFormat::Yaml => print!("{}", serde_yaml_ng::to_string(&report)?),
    }

    Ok(())
}

fn fail_on_error(host: &Host) -> Result<()> {
    let error = host.notifications.all().into_iter().find_map(|n| match n {
        Notification::Error(message) => Some(message),
        _ => None,
    });

    match error {
        Some(message) => bail!(message),
        None => Ok(()),
    }
}

#[derive(Debug, Serialize)]
struct SeekOutcome {
    target: f64,
    path: &'static str,
    probes: usize,
    frame_timestamp: Option<f64>,
    audio_timestamp: Option<f64>,
    duration: Option<f64>,
    bytes_total: u64,
}

impl SeekOutcome {
    fn display(&self) {
        println!();
        println!("Seek Result");
        println!("  Target                    {}", time_str(self.target));
        println!("  Path                      {}", self.path);
        println!("  Bisection probes          {}", self.probes);
        match self.frame_timestamp {
            Some(ts) => println!("  First frame               {}", time_str(ts)),
            None => println!("  First frame               none"),
        }
        match self.audio_timestamp {
            Some(ts) => println!("  First audio               {}", time_str(ts)),
            None => println!("  First audio               none"),
        }
        match self.duration {
            Some(d) => println!("  Duration                  {}", time_str(d)),
            None => println!("  Duration                  unknown"),
        }
        println!("  Size                      {} bytes", self.bytes_total);
        println!();
    }
}
