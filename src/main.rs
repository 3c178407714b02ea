// src/main.rs
use std::cell::RefCell;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use thumbfetch::config::load_config;
use thumbfetch::pipeline::{SlotId, Thumbnail, ThumbnailPipeline, Viewport};

const DEFAULT_VISIBLE: usize = 12;
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Accepts a JSON array of strings or one URL per line (`#` comments allowed).
fn load_urls(path: &Path) -> Result<Vec<String>, String> {
    let raw = fs::read_to_string(path).map_err(|e| format!("read {}: {e}", path.display()))?;
    if raw.trim_start().starts_with('[') {
        return serde_json::from_str::<Vec<String>>(&raw)
            .map_err(|e| format!("parse {}: {e}", path.display()));
    }
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn parse_arg(args: &[String], idx: usize, default: usize) -> usize {
    args.get(idx)
        .and_then(|s| s.parse().ok())
        .filter(|n| *n > 0)
        .unwrap_or(default)
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: thumbfetch <urls.json|urls.txt> [visible] [step]");
        std::process::exit(1);
    }

    let urls = match load_urls(Path::new(&args[1])) {
        Ok(u) if !u.is_empty() => u,
        Ok(_) => {
            error!("no urls in {}", args[1]);
            std::process::exit(1);
        }
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    let visible = parse_arg(&args, 2, DEFAULT_VISIBLE).min(urls.len());
    let step = parse_arg(&args, 3, visible);

    let cfg = load_config();
    let mut pipeline = match ThumbnailPipeline::from_config(&cfg) {
        Ok(p) => p,
        Err(e) => {
            error!("pipeline setup failed: {e}");
            std::process::exit(1);
        }
    };

    // slot -> (position it currently shows, image bound to it)
    let bound: Rc<RefCell<HashMap<SlotId, (usize, Option<Arc<Thumbnail>>)>>> =
        Rc::new(RefCell::new(HashMap::new()));
    {
        let bound = Rc::clone(&bound);
        pipeline.set_slot_listener(move |slot: SlotId, img: Arc<Thumbnail>, url: &str| {
            if let Some(entry) = bound.borrow_mut().get_mut(&slot) {
                info!("slot {} <- {url} ({}x{})", slot.0, img.width(), img.height());
                entry.1 = Some(img);
            }
        });
    }

    if let Err(e) = pipeline.start() {
        error!("{e}");
        std::process::exit(1);
    }

    let started = Instant::now();
    let mut first = 0usize;
    while first < urls.len() {
        let last = (first + visible).min(urls.len()) - 1;
        info!("viewport {first}..={last} of {}", urls.len());

        // recycle the same slots for every page
        for (i, position) in (first..=last).enumerate() {
            let slot = SlotId(i as u64);
            let hit = pipeline.request_slot(slot, &urls[position]);
            bound.borrow_mut().insert(slot, (position, hit));
        }
        for i in (last - first + 1)..visible {
            let slot = SlotId(i as u64);
            pipeline.release_slot(slot);
            bound.borrow_mut().remove(&slot);
        }

        pipeline.viewport_changed(Viewport::new(first, last, urls.len()), &urls);

        let deadline = Instant::now() + SETTLE_TIMEOUT;
        while !pipeline.is_idle() && Instant::now() < deadline {
            pipeline.poll_for(POLL_SLICE);
        }
        let missing = bound.borrow().values().filter(|(_, img)| img.is_none()).count();
        if missing > 0 {
            warn!("{missing} slot(s) kept their placeholder");
        }

        first += step;
    }

    pipeline.join();
    let stats = pipeline.cache().stats();
    println!(
        "{} urls in {:.1}s; cache {} entries, {}/{} KiB, hit rate {:.0}%, {} evictions",
        urls.len(),
        started.elapsed().as_secs_f32(),
        stats.entries,
        stats.size_kib,
        stats.capacity_kib,
        stats.hit_rate() * 100.0,
        stats.evictions
    );
}
