// ==========================================
// Threads, cores, signals
// ==========================================

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info};

use crate::clock::Clock;
use crate::config::EmulatorConfig;
use crate::error::RuntimeError;
use crate::pipeline::Pipeline;
use crate::stage::{PollPolicy, Shutdown, Stage};
use crate::stats::StatsReporter;

const MONITOR_PERIOD: Duration = Duration::from_millis(10);

static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SIGNALLED.store(true, Ordering::Relaxed);
}

/// Route SIGINT and SIGTERM to the process-wide stop flag.
pub fn install_signal_handlers() {
    // SAFETY: on_signal is an extern "C" fn with a stable address that only
    // performs one atomic store, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, on_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as *const () as libc::sighandler_t);
    }
}

pub fn signalled() -> bool {
    SIGNALLED.load(Ordering::Relaxed)
}

pub fn pin_to_core(core: usize) -> io::Result<()> {
    // SAFETY: all-zeroes is a valid cpu_set_t; CPU_SET stays within it for
    // any core below CPU_SETSIZE, which sched_setaffinity checks.
    let rc = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Core-count check: three stages per port plus the rate limiter.
pub fn check_cores(config: &EmulatorConfig) -> Result<(), RuntimeError> {
    let required = config.required_cores();
    if config.lcores.len() != required {
        return Err(RuntimeError::CoreCount {
            ports: config.port_count(),
            required,
            got: config.lcores.len(),
        });
    }
    Ok(())
}

pub struct Emulator<C> {
    pipeline: Pipeline<C>,
    lcores: Vec<usize>,
    pin_threads: bool,
    poll: PollPolicy,
    stats_interval: Option<Duration>,
    shutdown: Shutdown,
}

impl<C: Clock + Clone + 'static> Emulator<C> {
    pub fn new(
        config: &EmulatorConfig,
        pipeline: Pipeline<C>,
        shutdown: Shutdown,
    ) -> Result<Self, RuntimeError> {
        check_cores(config)?;
        Ok(Self {
            pipeline,
            lcores: config.lcores.clone(),
            pin_threads: config.pin_threads,
            poll: config.poll,
            stats_interval: config.stats_interval,
            shutdown,
        })
    }

    /// Launch one thread per stage and wait for all of them to exit.
    ///
    /// Returns once the shutdown flag is set (by a signal, by the caller or
    /// by a stage thread exiting on its own) and every stage thread has
    /// joined.
    pub fn run(self) -> Result<(), RuntimeError> {
        let paths = self.pipeline.paths().to_vec();
        let ports: Vec<_> = self.pipeline.table().iter().map(|e| e.port.clone()).collect();
        let stages = self.pipeline.into_stages();
        if let Some(&core) = self.lcores.get(stages.len()) {
            info!(core, "rate limiter disabled, core left idle");
        }

        let mut reporter = self
            .stats_interval
            .map(|interval| StatsReporter::new(paths.clone(), interval).with_ports(ports.clone()));
        let result = run_stages(
            stages,
            &self.lcores,
            self.pin_threads,
            self.poll,
            &self.shutdown,
            || {
                if let Some(r) = reporter.as_mut() {
                    r.check_and_report();
                }
            },
        );

        StatsReporter::new(paths, Duration::ZERO)
            .with_ports(ports)
            .summary();
        result
    }
}

/// Spawn `stages` onto `lcores` in order, then watch them from the calling
/// thread, calling `on_tick` every monitor period. Stops every stage when a
/// signal arrives or any stage thread exits while the rest still run.
fn run_stages(
    stages: Vec<(String, Box<dyn Stage>)>,
    lcores: &[usize],
    pin: bool,
    poll: PollPolicy,
    shutdown: &Shutdown,
    mut on_tick: impl FnMut(),
) -> Result<(), RuntimeError> {
    let mut handles: Vec<(String, JoinHandle<Result<(), RuntimeError>>)> = Vec::new();
    let mut launch_error = None;
    for ((name, stage), &core) in stages.into_iter().zip(lcores) {
        match spawn_stage(&name, stage, core, pin, poll, shutdown) {
            Ok(handle) => handles.push((name, handle)),
            Err(e) => {
                error!(stage = %name, error = %e, "cannot launch stage");
                shutdown.trigger();
                launch_error = Some(e);
                break;
            }
        }
    }

    while !shutdown.is_triggered() {
        if signalled() {
            info!("signal received, stopping");
            shutdown.trigger();
            break;
        }
        if let Some((name, _)) = handles.iter().find(|(_, h)| h.is_finished()) {
            error!(stage = %name, "stage exited unexpectedly, stopping");
            shutdown.trigger();
            break;
        }
        on_tick();
        thread::sleep(MONITOR_PERIOD);
    }

    let mut result = launch_error.map_or(Ok(()), Err);
    for (name, handle) in handles {
        let outcome = match handle.join() {
            Ok(r) => r,
            Err(_) => Err(RuntimeError::StagePanicked(name)),
        };
        if let Err(e) = outcome {
            error!(error = %e, "stage failed");
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    result
}

fn spawn_stage(
    name: &str,
    mut stage: Box<dyn Stage>,
    core: usize,
    pin: bool,
    poll: PollPolicy,
    shutdown: &Shutdown,
) -> Result<JoinHandle<Result<(), RuntimeError>>, RuntimeError> {
    let shutdown = shutdown.clone();
    let stage_name = name.to_string();
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if pin {
                if let Err(source) = pin_to_core(core) {
                    shutdown.trigger();
                    return Err(RuntimeError::Affinity {
                        stage: stage_name,
                        core,
                        source,
                    });
                }
            }
            info!(stage = %stage_name, kind = stage.kind(), core, pinned = pin, "stage started");
            stage.run(&shutdown, poll);
            info!(stage = %stage_name, "stage stopped");
            Ok(())
        })
        .map_err(|source| RuntimeError::Spawn {
            name: name.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkSpec;

    fn config() -> EmulatorConfig {
        EmulatorConfig::new(vec![LinkSpec {
            a: "a".into(),
            b: "b".into(),
            delay_us: 0,
        }])
    }

    #[test]
    fn test_core_count_must_match() {
        let mut config = config();
        assert!(check_cores(&config).is_ok());
        config.lcores = vec![0, 1, 2];
        assert!(matches!(
            check_cores(&config),
            Err(RuntimeError::CoreCount {
                ports: 2,
                required: 7,
                got: 3
            })
        ));
    }

    struct Idle;

    impl Stage for Idle {
        fn kind(&self) -> &'static str {
            "idle"
        }

        fn poll(&mut self) -> usize {
            0
        }
    }

    struct Faulty;

    impl Stage for Faulty {
        fn kind(&self) -> &'static str {
            "faulty"
        }

        fn poll(&mut self) -> usize {
            panic!("stage fault");
        }
    }

    #[test]
    fn test_panicked_stage_stops_the_others() {
        let shutdown = Shutdown::new();
        let stages: Vec<(String, Box<dyn Stage>)> = vec![
            ("idle-0".to_string(), Box::new(Idle)),
            ("faulty".to_string(), Box::new(Faulty)),
            ("idle-1".to_string(), Box::new(Idle)),
        ];
        let mut ticks = 0;
        let result = run_stages(
            stages,
            &[0, 1, 2],
            false,
            PollPolicy::Yield,
            &shutdown,
            || ticks += 1,
        );

        assert!(shutdown.is_triggered());
        assert!(matches!(result, Err(RuntimeError::StagePanicked(name)) if name == "faulty"));
        assert!(ticks < 1000);
    }

    #[test]
    fn test_external_shutdown_joins_cleanly() {
        let shutdown = Shutdown::new();
        let stages: Vec<(String, Box<dyn Stage>)> = vec![
            ("idle-0".to_string(), Box::new(Idle)),
            ("idle-1".to_string(), Box::new(Idle)),
        ];
        let trigger = shutdown.clone();
        let mut ticks = 0;
        let result = run_stages(
            stages,
            &[0, 1],
            false,
            PollPolicy::Yield,
            &shutdown,
            || {
                ticks += 1;
                if ticks == 3 {
                    trigger.trigger();
                }
            },
        );
        assert!(result.is_ok());
        assert_eq!(ticks, 3);
    }
}
