mod providers;

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::rc::Rc;
use std::sync::Arc;

use foundation::extent::{Extent, TileCoord};
use foundation::ids::{LayerId, TileId};
use foundation::time::{Clock, ManualClock, Timestamp};
use layers::{ColorLayer, ColorMap, ElevationEncoding, ElevationLayer, Layer, ProcessReport, UpdateContext};
use runtime::event_bus::ChangeNotifier;
use scene::tree::TileTree;
use streaming::command::LayerSource;
use streaming::provider::ProviderContext;
use streaming::scheduler::{Scheduler, SchedulerConfig};
use streaming::update_state::RetryPolicy;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::providers::{CheckerImagery, SyntheticTerrain};

const FRAME_MS: u64 = 16;

struct Layers {
    imagery: ColorLayer,
    overlay: ColorLayer,
    terrain: ElevationLayer,
}

impl Layers {
    fn all(&mut self) -> [&mut dyn Layer; 3] {
        [&mut self.imagery, &mut self.overlay, &mut self.terrain]
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut config = match env::var("VIEWER_CONFIG") {
        Ok(path) => {
            let json = fs::read_to_string(&path).expect("unreadable VIEWER_CONFIG");
            SchedulerConfig::from_json(&json).expect("invalid VIEWER_CONFIG")
        }
        Err(_) => SchedulerConfig::default(),
    };
    config.max_commands_per_host =
        env_var_usize("VIEWER_MAX_COMMANDS_PER_HOST", config.max_commands_per_host);
    if let Some(ms) = env_var_opt_u64("VIEWER_COMMAND_TIMEOUT_MS") {
        config.command_timeout_ms = Some(ms);
    }
    let ticks = env_var_usize("VIEWER_TICKS", 240);
    let depth = env_var_u32("VIEWER_DEPTH", 4).min(16) as u8;

    let clock = Arc::new(ManualClock::new(Timestamp::ZERO));
    let mut scheduler = Scheduler::new(config, ProviderContext::new(clock.clone()));
    scheduler
        .add_protocol_provider("checker", Rc::new(CheckerImagery::new(3)))
        .expect("register checker provider");
    scheduler
        .add_protocol_provider("checker-flaky", Rc::new(CheckerImagery::new(5).failing_every(5)))
        .expect("register flaky provider");
    scheduler
        .add_protocol_provider("terrain", Rc::new(SyntheticTerrain::new(4, depth.saturating_sub(2))))
        .expect("register terrain provider");
    info!(config = ?scheduler.config(), ticks, depth, "viewer starting");

    let imagery = LayerSource::new(LayerId(1), "checker")
        .with_url("https://tiles.example.com/{z}/{x}/{y}.png")
        .with_priority(3);
    let overlay = LayerSource::new(LayerId(2), "checker-flaky")
        .with_url("https://overlay.example.org/{z}/{x}/{y}.png");
    let terrain = LayerSource::new(LayerId(3), "terrain").with_url("https://dem.example.net/{z}/{x}/{y}");

    let mut layers = Layers {
        imagery: ColorLayer::new(imagery, &mut scheduler).expect("imagery layer"),
        overlay: ColorLayer::new(overlay, &mut scheduler)
            .expect("overlay layer")
            .with_tint([1.0, 0.6, 0.6])
            .with_elevation_range(0.0, 4000.0)
            .with_retry_policy(RetryPolicy {
                max_retries: 2,
                ..RetryPolicy::default()
            }),
        terrain: ElevationLayer::new(terrain, ElevationEncoding::RawNumeric, &mut scheduler)
            .expect("terrain layer")
            .with_no_data(-32768.0)
            .with_colormap(ColorMap::terrain(0.0, 1.0)),
    };
    layers.overlay.properties_mut().set_opacity(0.5);
    let imagery_id = layers.imagery.id();

    let view = Arc::new(ChangeNotifier::new());
    let mut tree = TileTree::default();
    let root = tree.add_root(TileCoord::new(0, 0, 0), Extent::wgs84());
    let mut dirty: BTreeSet<TileId> = BTreeSet::from([root]);
    let mut totals = ProcessReport::default();

    for frame in 0..ticks {
        clock.advance(FRAME_MS);
        let now = clock.now();
        dirty.extend(view.drain_due(now).into_iter().map(|e| e.tile));

        if frame == ticks / 2 {
            let removed = tree.collapse(root);
            info!(frame, removed, "collapsed the root; refetches should hit the cache");
        }

        // Split loaded leaves until the target depth is reached.
        let ready: Vec<TileId> = tree
            .iter()
            .filter(|t| t.children.is_empty() && t.level() < depth)
            .filter(|t| {
                t.material.owns_texture(imagery_id)
                    || t.layer_state(imagery_id).is_some_and(|s| s.has_finished())
            })
            .map(|t| t.id)
            .collect();
        for id in ready {
            let Ok(children) = tree.subdivide(id) else {
                continue;
            };
            for child in children {
                if let Some(tile) = tree.get_mut(child) {
                    tile.priority = tile.level() as i32;
                }
                dirty.insert(child);
            }
        }

        let mut ctx = UpdateContext {
            tree: &mut tree,
            scheduler: &mut scheduler,
            view: view.clone(),
            now,
        };
        for tile in std::mem::take(&mut dirty) {
            if !ctx.tree.contains(tile) {
                continue;
            }
            for layer in layers.all() {
                match layer.update(&mut ctx, tile) {
                    Ok(outcome) => debug!(layer = %layer.id(), tile = %tile, ?outcome, "tile updated"),
                    Err(err) => error!(layer = %layer.id(), tile = %tile, error = %err, "tile update failed"),
                }
            }
        }

        ctx.scheduler.tick();
        for layer in layers.all() {
            match layer.process_results(&mut ctx) {
                Ok(report) => totals.absorb(&report),
                Err(err) => {
                    if let Some(report) = err.report() {
                        totals.absorb(report);
                    }
                    error!(layer = %layer.id(), error = %err, "processing results failed");
                }
            }
        }

        for tile in tree.iter_mut() {
            if let Some(repaint) = tile.material.update_atlas() {
                debug!(
                    tile = %tile.id,
                    width = repaint.width,
                    height = repaint.height,
                    placed = repaint.placements.len(),
                    full = repaint.full_repack,
                    "atlas repainted"
                );
            }
        }

        if frame % 60 == 0 {
            info!(
                frame,
                tiles = tree.len(),
                waiting = scheduler.commands_waiting_execution_count(),
                running = scheduler.commands_running_count(),
                "progress"
            );
        }
    }

    info!(
        applied = totals.applied,
        cancelled = totals.cancelled,
        failed = totals.failed,
        cached = scheduler.context().cache.len(),
        "run finished"
    );
    if let Some((min, max)) = layers.terrain.elevation_range() {
        let mid = (min + max) * 0.5;
        info!(min, max, mid_color = ?layers.terrain.color_at(mid), "terrain range");
    }
    match serde_json::to_string_pretty(&scheduler.snapshot()) {
        Ok(json) => println!("{json}"),
        Err(err) => error!(error = %err, "could not serialize scheduler snapshot"),
    }
}

fn env_var_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_var_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_var_opt_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
