use anyhow::Result;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;

use super::command::{Cli, InfoArgs, ReportFormat};
use crate::input::InputReader;
use crate::timestamp::time_str;
use oggplay::process::decode::Decoder;
use oggplay::structs::audio::AudioCodecInfo;
use oggplay::structs::comment::CommentHeader;
use oggplay::structs::theora::TheoraInfo;

pub fn cmd_info(args: &InfoArgs, cli: &Cli, multi: Option<&MultiProgress>) -> Result<()> {
    log::info!("Analyzing Ogg stream: {}", args.input.display());

    let mut input_reader = InputReader::new(&args.input)?;
    let mut decoder = Decoder::default();
    decoder.set_fail_level(cli.fail_level());

    let mut context = ScanContext::default();

    if let Some(multi) = multi {
        let pb = multi.add(ProgressBar::new_spinner());
        pb.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        pb.set_message("Reading headers...");
        context.pb = Some(pb);
    }

    input_reader.process_chunks(64 * 1024, |chunk| {
        context.total_bytes += chunk.len() as u64;
        decoder.receive_input(chunk)?;
        context.drain(&mut decoder)?;

        Ok(!(args.headers_only && decoder.is_loaded()))
    })?;

    if let Some(ref pb) = context.pb {
        pb.finish_and_clear();
    }

    if !decoder.is_loaded() {
        println!("No complete stream headers found in the input.");
        println!("This doesn't appear to be a valid Ogg stream.");
        return Ok(());
    }

    let report = StreamReport::new(&decoder, &context, args.headers_only);
    match args.format {
        ReportFormat::Text => report.display(),
        ReportFormat::Yaml => print!("{}", serde_yaml_ng::to_string(&report)?),
    }

    Ok(())
}

/// Running totals of a full scan.
#[derive(Default)]
struct ScanContext {
    total_bytes: u64,
    frames: u64,
    video_end: Option<f64>,
    audio_samples: u64,
    audio_end: Option<f64>,
    pb: Option<ProgressBar>,
}

impl ScanContext {
    /// Pulls everything the decoder can produce from the buffered input.
    fn drain(&mut self, decoder: &mut Decoder) -> Result<()> {
        let frame_duration = decoder
            .video_info()
            .map_or(0.0, TheoraInfo::frame_duration);

        loop {
            let progressed = decoder.process()?;
            let mut consumed = false;

            if decoder.is_frame_ready() {
                if let Some(ts) = decoder.frame_timestamp() {
                    self.video_end = Some(ts + frame_duration);
                }
                decoder.discard_frame();
                self.frames += 1;
                consumed = true;

                if self.frames.is_multiple_of(100) {
                    if let Some(ref pb) = self.pb {
                        pb.set_message(format!("Scanning frames...         {}", self.frames));
                    }
                }
            }

            if decoder.is_audio_ready() {
                if decoder.decode_audio() {
                    if let Some(buffer) = decoder.dequeue_audio() {
                        self.audio_samples += buffer.sample_count as u64;
                        if let Some(ts) = buffer.timestamp {
                            self.audio_end = Some(ts + buffer.duration());
                        }
                    }
                }
                consumed = true;
            }

            if !progressed && !consumed {
                return Ok(());
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct StreamReport {
    bytes_read: u64,
    video: Option<VideoReport>,
    audio: Option<AudioReport>,
    index: Option<IndexReport>,
    ignored_serials: Vec<String>,
    duration: Option<f64>,
    scanned: Option<ScanReport>,
}

#[derive(Debug, Serialize)]
struct VideoReport {
    serial: String,
    codec: &'static str,
    version: String,
    frame_size: (u32, u32),
    picture_size: (u32, u32),
    picture_offset: (u32, u32),
    pixel_format: String,
    fps: f64,
    aspect_ratio: f64,
    keyframe_granule_shift: u8,
    vendor: Option<String>,
    comments: Vec<String>,
}

#[derive(Debug, Serialize)]
struct AudioReport {
    serial: String,
    codec: &'static str,
    channels: u8,
    sample_rate: u32,
    pre_skip: u64,
    vendor: Option<String>,
    comments: Vec<String>,
}

#[derive(Debug, Serialize)]
struct IndexReport {
    serial: String,
    segment_length: Option<u64>,
    content_offset: Option<u64>,
    video_keypoints: usize,
    audio_keypoints: usize,
}

#[derive(Debug, Serialize)]
struct ScanReport {
    frames: u64,
    audio_samples: u64,
    video_end: Option<f64>,
    audio_end: Option<f64>,
}

fn serial_str(serial: u32) -> String {
    format!("{serial:#010X}")
}

fn comments_of(comment: Option<&CommentHeader>) -> (Option<String>, Vec<String>) {
    match comment {
        Some(c) => (Some(c.vendor.clone()), c.comments.clone()),
        None => (None, Vec::new()),
    }
}

impl StreamReport {
    fn new(decoder: &Decoder, context: &ScanContext, headers_only: bool) -> Self {
        let video = decoder
            .video_info()
            .zip(decoder.video_serial())
            .map(|(info, serial)| {
                let (vendor, comments) = comments_of(decoder.video_comment());
                VideoReport {
                    serial: serial_str(serial),
                    codec: "theora",
                    version: format!("{}.{}.{}", info.version.0, info.version.1, info.version.2),
                    frame_size: (info.frame_width, info.frame_height),
                    picture_size: (info.pic_width, info.pic_height),
                    picture_offset: (info.pic_x, info.pic_y),
                    pixel_format: format!("{:?}", info.pixel_format),
                    fps: info.fps(),
                    aspect_ratio: info.aspect_ratio(),
                    keyframe_granule_shift: info.keyframe_granule_shift,
                    vendor,
                    comments,
                }
            });

        let audio = decoder
            .audio_info()
            .zip(decoder.audio_serial())
            .map(|(info, serial)| audio_report(info, serial, decoder.audio_comment()));

        let index = decoder
            .index()
            .zip(decoder.index_serial())
            .map(|(index, serial)| IndexReport {
                serial: serial_str(serial),
                segment_length: index.segment_length(),
                content_offset: index.info().head.content_offset,
                video_keypoints: decoder.video_serial().map_or(0, |s| index.keypoint_count(s)),
                audio_keypoints: decoder.audio_serial().map_or(0, |s| index.keypoint_count(s)),
            });

        let scanned = (!headers_only).then(|| ScanReport {
            frames: context.frames,
            audio_samples: context.audio_samples,
            video_end: context.video_end,
            audio_end: context.audio_end,
        });

        let scanned_duration = match (context.video_end, context.audio_end) {
            (Some(v), Some(a)) => Some(v.max(a)),
            (v, a) => v.or(a),
        };

        Self {
            bytes_read: context.total_bytes,
            video,
            audio,
            index,
            ignored_serials: decoder.ignored_serials().iter().map(|&s| serial_str(s)).collect(),
            duration: decoder.duration().or(scanned_duration.filter(|_| !headers_only)),
            scanned,
        }
    }

    fn display(&self) {
        println!();
        println!("Ogg Stream Information");
        println!("======================");
        println!();

        if let Some(video) = &self.video {
            println!("Video Stream");
            println!("  Serial                    {}", video.serial);
            println!("  Codec                     {} {}", video.codec, video.version);
            println!("  Frame size                {}x{}", video.frame_size.0, video.frame_size.1);
            println!(
                "  Picture                   {}x{} at ({}, {})",
                video.picture_size.0, video.picture_size.1, video.picture_offset.0, video.picture_offset.1
            );
            println!("  Pixel format              {}", video.pixel_format);
            println!("  Frame rate                {:.3} fps", video.fps);
            println!("  Aspect ratio              {:.4}", video.aspect_ratio);
            println!("  Keyframe granule shift    {}", video.keyframe_granule_shift);
            display_comments(video.vendor.as_deref(), &video.comments);
            println!();
        }

        if let Some(audio) = &self.audio {
            println!("Audio Stream");
            println!("  Serial                    {}", audio.serial);
            println!("  Codec                     {}", audio.codec);
            println!("  Channels                  {}", audio.channels);
            println!("  Sampling rate             {} Hz", audio.sample_rate);
            if audio.pre_skip > 0 {
                println!("  Pre-skip                  {} samples", audio.pre_skip);
            }
            display_comments(audio.vendor.as_deref(), &audio.comments);
            println!();
        }

        if let Some(index) = &self.index {
            println!("Index Stream");
            println!("  Serial                    {}", index.serial);
            if let Some(length) = index.segment_length {
                println!("  Segment length            {length} bytes");
            }
            if let Some(offset) = index.content_offset {
                println!("  Content offset            {offset}");
            }
            println!("  Video keypoints           {}", index.video_keypoints);
            println!("  Audio keypoints           {}", index.audio_keypoints);
            println!();
        }

        if !self.ignored_serials.is_empty() {
            println!("Ignored streams             {}", self.ignored_serials.join(", "));
            println!();
        }

        println!("Analysis Summary");
        let size_mb = self.bytes_read as f64 / 1_000_000.0;
        println!("  Size                      {size_mb:.2} MB ({} bytes)", self.bytes_read);
        if let Some(scanned) = &self.scanned {
            println!("  Frames decoded            {}", scanned.frames);
            println!("  Audio samples decoded     {}", scanned.audio_samples);
        }
        match self.duration {
            Some(duration) => {
                println!("  Duration                  {}", time_str(duration));
                if duration > 0.0 && self.scanned.is_some() {
                    let kbps = (self.bytes_read as f64 * 8.0) / (duration * 1000.0);
                    println!("  Average data rate         {kbps:.1} kbps");
                }
            }
            None => println!("  Duration                  unknown"),
        }
        println!();
    }
}

fn audio_report(info: &AudioCodecInfo, serial: u32, comment: Option<&CommentHeader>) -> AudioReport {
    let layout = info.layout();
    let (vendor, comments) = comments_of(comment);

    AudioReport {
        serial: serial_str(serial),
        codec: info.name(),
        channels: layout.channels,
        sample_rate: layout.sample_rate,
        pre_skip: info.pre_skip(),
        vendor,
        comments,
    }
}

fn display_comments(vendor: Option<&str>, comments: &[String]) {
    if let Some(vendor) = vendor {
        println!("  Vendor                    {vendor}");
    }
    for comment in comments {
        println!("  Comment                   {comment}");
    }
}
