//! Engine assembly and lifecycle.
//!
//! Builds the pipeline for the configured runmode, spawns the stage and
//! management threads, and joins them in pipeline order at shutdown. Two
//! runmodes are wired: `workers` (the full slot chain on one thread, the
//! offline default) and `autofp` (a receive/decode thread feeding
//! flow-pinned stream/detect workers and a dedicated output thread).

use crate::config::{RunMode, RuntimeConfig};
use crate::detect::{DetectEngine, DetectThreadCtx};
use crate::flow::manager::FlowManager;
use crate::flow::FlowTable;
use crate::memory::Pool;
use crate::output::build_outputs;
use crate::packet::Packet;
use crate::pipeline::{
    DecodeSlot, DetectSlot, FlowSlot, OutputSink, PacketQueue, QueueHandler, RespondSlot, Slot,
    StageInput, StageSink, StageWorker, StreamSlot, ThreadVars, THV_FAILED,
};
use crate::source::pcap::{PcapFileSource, PcapLiveSource};
use crate::source::PacketSource;
use crate::stats::{aggregator_loop, StatsRegistry};
use crate::stream::StreamEngine;
use crate::utils::time::EngineClock;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crossbeam::channel::unbounded;
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;

/// The assembled engine, ready to run.
pub struct Runtime {
    cfg: RuntimeConfig,
    detect: Arc<DetectEngine>,
    kill: Arc<AtomicBool>,
}

impl Runtime {
    pub fn new(cfg: RuntimeConfig, detect: DetectEngine) -> Result<Runtime> {
        cfg.validate()?;
        Ok(Runtime {
            cfg,
            detect: Arc::new(detect),
            kill: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag that interrupts the run; wire it to SIGINT/SIGTERM.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.kill)
    }

    /// Runs the engine to completion (source EOF or shutdown signal).
    pub fn run(self) -> Result<()> {
        let registry = StatsRegistry::new();
        let clock = Arc::new(EngineClock::new());
        clock.set(crate::utils::time::Timestamp::now());
        let pool: Arc<Pool<Packet>> = Arc::new(Pool::new(
            "packets",
            self.cfg.mempool.capacity,
            self.cfg.mempool.prealloc,
            Packet::default,
        ));
        let table = Arc::new(FlowTable::new(&self.cfg.flow));
        let stream = Arc::new(StreamEngine::new(
            &self.cfg.stream,
            registry.register_thread("stream"),
        ));
        let outputs = build_outputs(&self.cfg.outputs, Arc::clone(&clock))?;

        let offline = self.cfg.source.pcap_file.is_some();
        let source: Box<dyn PacketSource> = if let Some(path) = &self.cfg.source.pcap_file {
            Box::new(PcapFileSource::open(path)?)
        } else {
            Box::new(PcapLiveSource::open(&self.cfg.source)?)
        };

        let runmode = match self.cfg.pipeline.runmode {
            RunMode::Auto => {
                if offline {
                    RunMode::Workers
                } else {
                    RunMode::AutoFp
                }
            }
            explicit => explicit,
        };
        log::info!("starting in {:?} runmode", runmode);

        let rejects = Arc::new(Mutex::new(Vec::new()));
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let mut tvs: Vec<(String, Arc<crate::pipeline::TvFlags>)> = Vec::new();

        // Management threads run for the whole engine lifetime.
        let mgmt_kill = Arc::new(AtomicBool::new(false));
        let (stats_tx, stats_rx) = unbounded();
        {
            let manager = FlowManager::new(
                Arc::clone(&table),
                Arc::clone(&clock),
                registry.register_thread("flow-manager"),
                Duration::from_millis(self.cfg.flow.manager_interval),
            );
            let kill = Arc::clone(&mgmt_kill);
            let affinity = self.cfg.pipeline.affinity.management.clone();
            handles.push(spawn_named("flow-manager", move || {
                pin_to(&affinity, 0);
                manager.run(kill);
            })?);
        }
        {
            let registry = Arc::clone(&registry);
            let kill = Arc::clone(&mgmt_kill);
            let interval = Duration::from_secs(self.cfg.pipeline.stats_interval.max(1));
            let affinity = self.cfg.pipeline.affinity.management.clone();
            handles.push(spawn_named("stats-wakeup", move || {
                pin_to(&affinity, 1);
                aggregator_loop(registry, interval, kill, Some(stats_tx));
            })?);
        }

        // Pipeline stage threads, leaves first.
        let mut stage_handles: Vec<(String, JoinHandle<()>)> = Vec::new();
        match runmode {
            RunMode::Workers | RunMode::Auto => {
                let tv = ThreadVars::new("worker-0");
                tvs.push((tv.name.clone(), Arc::clone(&tv.flags)));
                let mut worker = StageWorker {
                    tv,
                    slots: vec![
                        Slot::Decode(DecodeSlot {
                            pool: Arc::clone(&pool),
                            counters: registry.register_thread("worker-0.decode"),
                        }),
                        Slot::FlowAttach(FlowSlot {
                            table: Arc::clone(&table),
                            clock: Arc::clone(&clock),
                            counters: registry.register_thread("worker-0.flow"),
                        }),
                        Slot::Stream(StreamSlot {
                            engine: Arc::clone(&stream),
                        }),
                        Slot::Detect(DetectSlot {
                            engine: Arc::clone(&self.detect),
                            ctx: DetectThreadCtx::new(),
                            counters: registry.register_thread("worker-0.detect"),
                        }),
                        Slot::Respond(RespondSlot {
                            rejects: Some(Arc::clone(&rejects)),
                            verdicts: None,
                            counters: registry.register_thread("worker-0.respond"),
                        }),
                    ],
                    input: StageInput::Source(source),
                    sink: StageSink::Output(OutputSink {
                        loggers: outputs,
                        pool: Arc::clone(&pool),
                        counters: registry.register_thread("worker-0.output"),
                    }),
                    pool: Arc::clone(&pool),
                    kill: Arc::clone(&self.kill),
                    upstream_done: None,
                    done: Arc::new(AtomicBool::new(false)),
                    counters: registry.register_thread("worker-0"),
                    rejects: Some(Arc::clone(&rejects)),
                    stats_rx: Some(stats_rx),
                };
                let affinity = self.cfg.pipeline.affinity.worker.clone();
                stage_handles.push((
                    "worker-0".into(),
                    spawn_named("worker-0", move || {
                        pin_to(&affinity, 0);
                        worker.run();
                    })?,
                ));
            }
            RunMode::AutoFp => {
                let nworkers = self.cfg.pipeline.workers.max(1);
                let depth = self.cfg.pipeline.queue_depth;
                let worker_queues: Vec<Arc<PacketQueue>> = (0..nworkers)
                    .map(|i| Arc::new(PacketQueue::new(&format!("pickup-{}", i), depth)))
                    .collect();
                let out_queue = Arc::new(PacketQueue::new("output", depth));
                let rx_done = Arc::new(AtomicBool::new(false));
                let workers_done = Arc::new(AtomicBool::new(false));

                // Receive + decode + flow attach.
                {
                    let tv = ThreadVars::new("receive");
                    tvs.push((tv.name.clone(), Arc::clone(&tv.flags)));
                    let mut rx = StageWorker {
                        tv,
                        slots: vec![
                            Slot::Decode(DecodeSlot {
                                pool: Arc::clone(&pool),
                                counters: registry.register_thread("receive.decode"),
                            }),
                            Slot::FlowAttach(FlowSlot {
                                table: Arc::clone(&table),
                                clock: Arc::clone(&clock),
                                counters: registry.register_thread("receive.flow"),
                            }),
                        ],
                        input: StageInput::Source(source),
                        sink: StageSink::Forward(QueueHandler::FlowAffine(
                            worker_queues.clone(),
                        )),
                        pool: Arc::clone(&pool),
                        kill: Arc::clone(&self.kill),
                        upstream_done: None,
                        done: Arc::clone(&rx_done),
                        counters: registry.register_thread("receive"),
                        rejects: Some(Arc::clone(&rejects)),
                        stats_rx: None,
                    };
                    let affinity = self.cfg.pipeline.affinity.receive.clone();
                    stage_handles.push((
                        "receive".into(),
                        spawn_named("receive", move || {
                            pin_to(&affinity, 0);
                            rx.run();
                        })?,
                    ));
                }

                // Stream + detect + respond workers, flow-pinned.
                for (i, in_queue) in worker_queues.iter().enumerate() {
                    let name = format!("worker-{}", i);
                    let tv = ThreadVars::new(&name);
                    tvs.push((tv.name.clone(), Arc::clone(&tv.flags)));
                    let mut worker = StageWorker {
                        tv,
                        slots: vec![
                            Slot::Stream(StreamSlot {
                                engine: Arc::clone(&stream),
                            }),
                            Slot::Detect(DetectSlot {
                                engine: Arc::clone(&self.detect),
                                ctx: DetectThreadCtx::new(),
                                counters: registry
                                    .register_thread(&format!("{}.detect", name)),
                            }),
                            Slot::Respond(RespondSlot {
                                rejects: Some(Arc::clone(&rejects)),
                                verdicts: None,
                                counters: registry
                                    .register_thread(&format!("{}.respond", name)),
                            }),
                        ],
                        input: StageInput::Queue(Arc::clone(in_queue)),
                        sink: StageSink::Forward(QueueHandler::Simple(Arc::clone(
                            &out_queue,
                        ))),
                        pool: Arc::clone(&pool),
                        kill: Arc::clone(&self.kill),
                        upstream_done: Some(Arc::clone(&rx_done)),
                        done: Arc::new(AtomicBool::new(false)),
                        counters: registry.register_thread(&name),
                        rejects: None,
                        stats_rx: None,
                    };
                    let affinity = self.cfg.pipeline.affinity.worker.clone();
                    stage_handles.push((
                        name.clone(),
                        spawn_named(&name, move || {
                            pin_to(&affinity, i);
                            worker.run();
                        })?,
                    ));
                }

                // Output fan-out.
                {
                    let tv = ThreadVars::new("output");
                    tvs.push((tv.name.clone(), Arc::clone(&tv.flags)));
                    let mut out = StageWorker {
                        tv,
                        slots: Vec::new(),
                        input: StageInput::Queue(Arc::clone(&out_queue)),
                        sink: StageSink::Output(OutputSink {
                            loggers: outputs,
                            pool: Arc::clone(&pool),
                            counters: registry.register_thread("output.sink"),
                        }),
                        pool: Arc::clone(&pool),
                        kill: Arc::clone(&self.kill),
                        upstream_done: Some(Arc::clone(&workers_done)),
                        done: Arc::new(AtomicBool::new(false)),
                        counters: registry.register_thread("output"),
                        rejects: None,
                        stats_rx: Some(stats_rx),
                    };
                    let affinity = self.cfg.pipeline.affinity.output.clone();
                    stage_handles.push((
                        "output".into(),
                        spawn_named("output", move || {
                            pin_to(&affinity, 0);
                            out.run();
                        })?,
                    ));
                }

                // Join in pipeline order: receive, workers, then output.
                let mut iter = stage_handles.drain(..);
                let (name, rx_handle) = iter.next().expect("receive stage");
                let rest: Vec<_> = iter.collect();
                join_stage(&name, rx_handle);
                let (out_entry, worker_entries): (Vec<_>, Vec<_>) =
                    rest.into_iter().partition(|(n, _)| n == "output");
                for (name, handle) in worker_entries {
                    join_stage(&name, handle);
                }
                workers_done.store(true, Ordering::Release);
                for (name, handle) in out_entry {
                    join_stage(&name, handle);
                }
            }
        }

        // Workers runmode joins here; autofp already joined above.
        for (name, handle) in stage_handles {
            join_stage(&name, handle);
        }

        // Stop management, then settle the tables.
        mgmt_kill.store(true, Ordering::Release);
        let drained = table.drain();
        log::info!("drained {} flows at shutdown", drained);

        let failed = tvs
            .iter()
            .filter(|(name, flags)| {
                let failed = flags.is_set(THV_FAILED);
                if failed {
                    log::error!("stage {} reported failure", name);
                }
                failed
            })
            .count();

        for handle in handles {
            let _ = handle.join();
        }

        // Packet conservation: every pool buffer came home.
        if pool.alloc_count() != pool.return_count() || pool.outstanding() != 0 {
            log::error!(
                "packet pool imbalance: {} allocated, {} returned",
                pool.alloc_count(),
                pool.return_count()
            );
        }

        let final_stats = registry.aggregate();
        for (name, value) in &final_stats {
            log::info!("counter {} = {}", name, value);
        }

        if failed > 0 {
            bail!("{} pipeline stage(s) failed", failed);
        }
        Ok(())
    }
}

fn spawn_named<F>(name: &str, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .with_context(|| format!("spawning {} thread", name))
}

fn join_stage(name: &str, handle: JoinHandle<()>) {
    if handle.join().is_err() {
        log::error!("stage {} panicked", name);
    }
}

/// Pins the current thread to the `idx`-th CPU of `set`, when configured.
fn pin_to(set: &[usize], idx: usize) {
    if set.is_empty() {
        return;
    }
    let core = set[idx % set.len()];
    let mut cpu_set = CpuSet::new();
    if cpu_set.set(core).is_ok() {
        if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
            log::warn!("failed to pin thread to core {}: {}", core, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;

    #[test]
    fn new_rejects_sourceless_config() {
        let cfg = default_config();
        let detect =
            DetectEngine::from_rules("", &cfg.detect).unwrap();
        assert!(Runtime::new(cfg, detect).is_err());
    }
}
