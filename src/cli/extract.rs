use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::{Result, bail};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::Level;

use super::command::{Cli, ExtractArgs};
use crate::input::InputReader;
use oggplay::process::sync::PageSync;
use oggplay::structs::page::Page;

pub fn cmd_extract(args: &ExtractArgs, cli: &Cli, multi: Option<&MultiProgress>) -> Result<()> {
    let mut input_reader = InputReader::new(&args.input)?;
    if input_reader.is_pipe() {
        log::info!("Extracting stream {:#010X} from standard input", args.serial);
    } else {
        log::info!(
            "Extracting stream {:#010X} from {}",
            args.serial,
            args.input.display()
        );
    }

    let mut writer = BufWriter::new(File::create(&args.output)?);
    let mut sync = PageSync::default();
    let mut stats = ExtractStats::default();

    let pb = match multi {
        Some(multi) => {
            let pb = multi.add(ProgressBar::new_spinner());
            pb.set_style(ProgressStyle::with_template(
                "{spinner:.green} {pos} pages copied\n{msg} | elapsed: {elapsed_precise}",
            )?);
            pb.enable_steady_tick(std::time::Duration::from_millis(100));
            Some(pb)
        }
        None => None,
    };

    input_reader.process_chunks(64 * 1024, |chunk| {
        sync.push_bytes(chunk);

        for page_result in sync.by_ref() {
            let page = match page_result {
                Ok(page) => page,
                Err(e) => {
                    if Level::Warn <= cli.fail_level() {
                        return Err(e.into());
                    }
                    log::warn!("{e}");
                    continue;
                }
            };
            stats.pages += 1;

            if page.serial() == args.serial {
                stats.copy(&page, &mut writer)?;
                if let Some(ref pb) = pb {
                    pb.set_position(stats.copied);
                }
            }
        }

        Ok(!stats.ended)
    })?;

    writer.flush()?;

    if let Some(ref pb) = pb {
        pb.finish_and_clear();
    }

    if stats.copied == 0 {
        bail!(
            "No pages with serial {:#010X} among {} pages",
            args.serial,
            stats.pages
        );
    }
    if !stats.ended {
        log::warn!("Stream {:#010X} has no end-of-stream page", args.serial);
    }

    log::info!(
        "Copied {} pages ({} bytes) of {} to {}",
        stats.copied,
        stats.bytes,
        stats.pages,
        args.output.display()
    );

    Ok(())
}

#[derive(Debug, Default)]
struct ExtractStats {
    pages: u64,
    copied: u64,
    bytes: u64,
    ended: bool,
}

impl ExtractStats {
    fn copy(&mut self, page: &Page, out: &mut impl Write) -> Result<()> {
        out.write_all(page.as_ref())?;
        self.copied += 1;
        self.bytes += page.as_ref().len() as u64;
        self.ended |= page.is_eos();
        Ok(())
    }
}
