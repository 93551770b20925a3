use std::collections::HashSet;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::impairment::{FourStateParams, GeParams, LossMode, RANDOM_MAX, percent_to_threshold};
use crate::stage::{MAX_BURST, PollPolicy};

pub const DEFAULT_DELAY_QUEUE_CAPACITY: usize = 4_194_304;
pub const DEFAULT_EGRESS_QUEUE_CAPACITY: usize = 512;

const MIN_RATE_BPS: u64 = 1_000;
const MAX_RATE_BPS: u64 = 10_000_000_000;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("no links given, at least one (port,port,delay_us) tuple is required")]
    MissingLinks,
    #[error("malformed link tuple {0:?}, expected (port,port,delay_us)")]
    MalformedLink(String),
    #[error("port {0:?} appears in more than one link")]
    DuplicatePort(String),
    #[error("port {0:?} cannot be linked to itself")]
    SelfLink(String),
    #[error("invalid rate {0:?}, expected <n>[k|M|G] bits/s")]
    InvalidRate(String),
    #[error("rate {0} bit/s outside 1 kbit/s ..= 10 Gbit/s")]
    RateOutOfRange(u64),
    #[error("invalid percentage {0:?}")]
    InvalidPercent(String),
    #[error("percentage {0} outside 0..=100")]
    PercentOutOfRange(f64),
    #[error("expected {expected} comma-separated percentages, got {got:?}")]
    WrongArity { expected: usize, got: String },
    #[error("{0} transition probabilities add up to more than 100%")]
    TransitionMass(&'static str),
    #[error("only one loss mode may be selected")]
    ConflictingLossModes,
    #[error("invalid cpu list {0:?}")]
    InvalidCpuList(String),
    #[error("{name} must be at least 1")]
    Zero { name: &'static str },
    #[error("burst {burst} exceeds the maximum of {max}")]
    BurstTooLarge { burst: usize, max: usize },
    #[error("packet pool of {pool} buffers cannot hold one burst of {burst}")]
    PoolTooSmall { pool: usize, burst: usize },
}

/// One `(a,b,delay_us)` tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    pub a: String,
    pub b: String,
    pub delay_us: u64,
}

#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    pub links: Vec<LinkSpec>,
    pub loss: LossMode,
    /// Duplication draw threshold; 0 disables.
    pub duplicate: u64,
    /// Bits per second, 0 = unlimited.
    pub rate_bps: u64,
    /// Cores in assignment order: ingress, delay, egress per port, then the
    /// rate limiter.
    pub lcores: Vec<usize>,
    pub pin_threads: bool,
    pub poll: PollPolicy,
    pub seed: u64,
    /// One Markov chain for every port, or one per port.
    pub shared_loss_state: bool,
    pub burst: usize,
    pub delay_queue_capacity: usize,
    pub egress_queue_capacity: usize,
    pub pool_size: usize,
    pub stats_interval: Option<Duration>,
    pub link_wait: Duration,
}

impl EmulatorConfig {
    /// Defaults for `links`: no impairment, unlimited rate, unpinned threads.
    pub fn new(links: Vec<LinkSpec>) -> Self {
        let ports = links.len() * 2;
        Self {
            links,
            loss: LossMode::None,
            duplicate: 0,
            rate_bps: 0,
            lcores: (0..3 * ports + 1).collect(),
            pin_threads: false,
            poll: PollPolicy::Spin,
            seed: 0,
            shared_loss_state: true,
            burst: MAX_BURST,
            delay_queue_capacity: DEFAULT_DELAY_QUEUE_CAPACITY,
            egress_queue_capacity: DEFAULT_EGRESS_QUEUE_CAPACITY,
            pool_size: default_pool_size(
                DEFAULT_DELAY_QUEUE_CAPACITY,
                DEFAULT_EGRESS_QUEUE_CAPACITY,
            ),
            stats_interval: None,
            link_wait: Duration::ZERO,
        }
    }

    pub fn port_count(&self) -> usize {
        self.links.len() * 2
    }

    /// Three stages per port plus the rate limiter.
    pub fn required_cores(&self) -> usize {
        3 * self.port_count() + 1
    }

    pub fn port_names(&self) -> Vec<String> {
        self.links
            .iter()
            .flat_map(|l| [l.a.clone(), l.b.clone()])
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.links.is_empty() {
            return Err(ConfigError::MissingLinks);
        }
        let mut seen = HashSet::new();
        for link in &self.links {
            if link.a == link.b {
                return Err(ConfigError::SelfLink(link.a.clone()));
            }
            for name in [&link.a, &link.b] {
                if !seen.insert(name.as_str()) {
                    return Err(ConfigError::DuplicatePort(name.clone()));
                }
            }
        }

        match self.loss {
            LossMode::None => {}
            LossMode::Uniform { loss } => check_threshold(loss)?,
            LossMode::GilbertElliott(p) => {
                for t in [p.loss_normal, p.loss_bad, p.normal_to_bad, p.bad_to_normal] {
                    check_threshold(t)?;
                }
            }
            LossMode::FourState(p) => {
                for t in [p.p13, p.p14, p.p23, p.p31, p.p32] {
                    check_threshold(t)?;
                }
                if p.p13 + p.p14 > RANDOM_MAX {
                    return Err(ConfigError::TransitionMass("state 1"));
                }
                if p.p31 + p.p32 > RANDOM_MAX {
                    return Err(ConfigError::TransitionMass("state 3"));
                }
            }
        }
        check_threshold(self.duplicate)?;

        if self.rate_bps != 0 && !(MIN_RATE_BPS..=MAX_RATE_BPS).contains(&self.rate_bps) {
            return Err(ConfigError::RateOutOfRange(self.rate_bps));
        }

        for (name, value) in [
            ("burst", self.burst),
            ("delay queue capacity", self.delay_queue_capacity),
            ("egress queue capacity", self.egress_queue_capacity),
            ("pool size", self.pool_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }
        if self.burst > MAX_BURST {
            return Err(ConfigError::BurstTooLarge {
                burst: self.burst,
                max: MAX_BURST,
            });
        }
        if self.pool_size < self.burst {
            return Err(ConfigError::PoolTooSmall {
                pool: self.pool_size,
                burst: self.burst,
            });
        }
        Ok(())
    }
}

fn check_threshold(t: u64) -> Result<(), ConfigError> {
    if t > RANDOM_MAX {
        return Err(ConfigError::PercentOutOfRange(
            t as f64 * 100.0 / RANDOM_MAX as f64,
        ));
    }
    Ok(())
}

/// Room for full delay and egress queues on both sides of a link.
pub fn default_pool_size(delay_capacity: usize, egress_capacity: usize) -> usize {
    2 * delay_capacity + 2 * egress_capacity
}

// ==========================================
// Parsers
// ==========================================

/// Parse `(a,b,delay)[,(c,d,delay)...]`. Anything between tuples is ignored.
pub fn parse_links(arg: &str) -> Result<Vec<LinkSpec>, ConfigError> {
    let mut links = Vec::new();
    let mut rest = arg;
    while let Some(open) = rest.find('(') {
        let after = &rest[open + 1..];
        let close = after
            .find(')')
            .ok_or_else(|| ConfigError::MalformedLink(rest[open..].to_string()))?;
        let body = &after[..close];
        let fields: Vec<&str> = body.split(',').map(str::trim).collect();
        let [a, b, delay] = fields[..] else {
            return Err(ConfigError::MalformedLink(body.to_string()));
        };
        if a.is_empty() || b.is_empty() {
            return Err(ConfigError::MalformedLink(body.to_string()));
        }
        let delay_us = delay
            .parse::<u64>()
            .map_err(|_| ConfigError::MalformedLink(body.to_string()))?;
        links.push(LinkSpec {
            a: a.to_string(),
            b: b.to_string(),
            delay_us,
        });
        rest = &after[close + 1..];
    }
    if links.is_empty() {
        return Err(ConfigError::MissingLinks);
    }
    Ok(links)
}

/// Parse a rate in bits/s with an optional decimal `k`, `M` or `G` suffix.
/// `0` means unlimited.
pub fn parse_rate(arg: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidRate(arg.to_string());
    let digits_end = arg.find(|c: char| !c.is_ascii_digit()).unwrap_or(arg.len());
    if digits_end == 0 {
        return Err(invalid());
    }
    let value: u64 = arg[..digits_end].parse().map_err(|_| invalid())?;
    let base: u64 = match &arg[digits_end..] {
        "" => 1,
        "k" | "K" => 1_000,
        "m" | "M" => 1_000_000,
        "g" | "G" => {
            if value > 10 {
                return Err(invalid());
            }
            1_000_000_000
        }
        _ => return Err(invalid()),
    };
    let rate = value.checked_mul(base).ok_or_else(invalid)?;
    if rate != 0 && !(MIN_RATE_BPS..=MAX_RATE_BPS).contains(&rate) {
        return Err(ConfigError::RateOutOfRange(rate));
    }
    Ok(rate)
}

pub fn parse_percent(arg: &str) -> Result<f64, ConfigError> {
    let value: f64 = arg
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidPercent(arg.to_string()))?;
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return Err(ConfigError::PercentOutOfRange(value));
    }
    Ok(value)
}

fn parse_thresholds<const N: usize>(arg: &str) -> Result<[u64; N], ConfigError> {
    let parts: Vec<&str> = arg.split(',').collect();
    if parts.len() != N {
        return Err(ConfigError::WrongArity {
            expected: N,
            got: arg.to_string(),
        });
    }
    let mut out = [0u64; N];
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = percent_to_threshold(parse_percent(part)?);
    }
    Ok(out)
}

/// `nl,bl,p_nb,p_bn`: loss in Normal, loss in Bad, Normal to Bad, Bad to
/// Normal, all in percent.
pub fn parse_gilbert_elliott(arg: &str) -> Result<GeParams, ConfigError> {
    let [loss_normal, loss_bad, normal_to_bad, bad_to_normal] = parse_thresholds::<4>(arg)?;
    Ok(GeParams {
        loss_normal,
        loss_bad,
        normal_to_bad,
        bad_to_normal,
    })
}

/// `p13,p14,p23,p31,p32` in percent.
pub fn parse_four_state(arg: &str) -> Result<FourStateParams, ConfigError> {
    let [p13, p14, p23, p31, p32] = parse_thresholds::<5>(arg)?;
    Ok(FourStateParams {
        p13,
        p14,
        p23,
        p31,
        p32,
    })
}

/// Parse `0-3,6,8-9`. Order is kept; repeated cores are an error.
pub fn parse_cpu_list(list: &str) -> Result<Vec<usize>, ConfigError> {
    let invalid = || ConfigError::InvalidCpuList(list.to_string());
    let mut cores = Vec::new();
    for part in list.split(',').map(str::trim) {
        if let Some((start, end)) = part.split_once('-') {
            let start: usize = start.trim().parse().map_err(|_| invalid())?;
            let end: usize = end.trim().parse().map_err(|_| invalid())?;
            if start > end {
                return Err(invalid());
            }
            cores.extend(start..=end);
        } else {
            cores.push(part.parse().map_err(|_| invalid())?);
        }
    }
    let unique: HashSet<_> = cores.iter().collect();
    if cores.is_empty() || unique.len() != cores.len() {
        return Err(invalid());
    }
    Ok(cores)
}

fn select_loss_mode(
    random: Option<f64>,
    ge: Option<GeParams>,
    four: Option<FourStateParams>,
) -> Result<LossMode, ConfigError> {
    match (random, ge, four) {
        (None, None, None) => Ok(LossMode::None),
        (Some(p), None, None) => Ok(LossMode::Uniform {
            loss: percent_to_threshold(p),
        }),
        (None, Some(p), None) => Ok(LossMode::GilbertElliott(p)),
        (None, None, Some(p)) => Ok(LossMode::FourState(p)),
        _ => Err(ConfigError::ConflictingLossModes),
    }
}

// ==========================================
// Command line
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PollMode {
    Spin,
    Yield,
    Sleep,
}

#[derive(Parser, Debug)]
#[command(
    name = "linkemu",
    version,
    about = "Emulate a lossy, delayed, rate-limited link between pairs of interfaces"
)]
pub struct Cli {
    /// Links as (port,port,delay_us)[,(port,port,delay_us)...]
    #[arg(short = 'P', long = "links")]
    pub links: Vec<String>,

    /// Uniform random loss in percent
    #[arg(short = 'r', long = "loss-random", value_parser = parse_percent)]
    pub loss_random: Option<f64>,

    /// Gilbert-Elliott loss: nl,bl,p_nb,p_bn in percent
    #[arg(short = 'g', long = "loss-ge", value_parser = parse_gilbert_elliott)]
    pub loss_ge: Option<GeParams>,

    /// Four-state Markov loss: p13,p14,p23,p31,p32 in percent
    #[arg(long = "loss-4state", value_parser = parse_four_state)]
    pub loss_four_state: Option<FourStateParams>,

    /// Duplication probability in percent
    #[arg(short = 'D', long = "duplicate", value_parser = parse_percent)]
    pub duplicate: Option<f64>,

    /// Bandwidth limit in bits/s, k/M/G suffixes accepted; 0 = unlimited
    #[arg(short = 's', long = "speed", value_parser = parse_rate, default_value = "0")]
    pub speed: u64,

    /// Cores to pin to, e.g. 0-6 (exactly 3 x ports + 1)
    #[arg(short = 'l', long = "lcores")]
    pub lcores: Option<String>,

    /// Idle behaviour of the stage loops
    #[arg(long = "poll", value_enum, default_value = "spin")]
    pub poll: PollMode,

    /// Sleep period for --poll sleep
    #[arg(long = "idle-sleep-us", default_value = "100")]
    pub idle_sleep_us: u64,

    /// Seed for the loss and duplication generators (random if unset)
    #[arg(long = "seed")]
    pub seed: Option<u64>,

    /// Give every port its own Markov loss state
    #[arg(long = "per-port-loss-state")]
    pub per_port_loss_state: bool,

    /// Maximum packets per stage iteration
    #[arg(long = "burst", default_value_t = MAX_BURST)]
    pub burst: usize,

    #[arg(long = "delay-queue-capacity", default_value_t = DEFAULT_DELAY_QUEUE_CAPACITY)]
    pub delay_queue_capacity: usize,

    #[arg(long = "egress-queue-capacity", default_value_t = DEFAULT_EGRESS_QUEUE_CAPACITY)]
    pub egress_queue_capacity: usize,

    /// Packet buffers (default: 2 x delay + 2 x egress capacity)
    #[arg(long = "pool-size")]
    pub pool_size: Option<usize>,

    /// Seconds between statistics reports, 0 disables
    #[arg(long = "stats-interval-secs", default_value = "1")]
    pub stats_interval_secs: u64,

    /// Seconds to wait for carrier on every port
    #[arg(long = "link-wait-secs", default_value = "9")]
    pub link_wait_secs: u64,
}

impl Cli {
    pub fn into_config(self) -> Result<EmulatorConfig, ConfigError> {
        let mut links = Vec::new();
        for arg in &self.links {
            links.extend(parse_links(arg)?);
        }
        let loss = select_loss_mode(self.loss_random, self.loss_ge, self.loss_four_state)?;
        let ports = links.len() * 2;
        let poll = match self.poll {
            PollMode::Spin => PollPolicy::Spin,
            PollMode::Yield => PollPolicy::Yield,
            PollMode::Sleep => PollPolicy::Sleep(Duration::from_micros(self.idle_sleep_us)),
        };
        let config = EmulatorConfig {
            loss,
            duplicate: self.duplicate.map_or(0, percent_to_threshold),
            rate_bps: self.speed,
            lcores: match self.lcores.as_deref() {
                Some(list) => parse_cpu_list(list)?,
                None => (0..3 * ports + 1).collect(),
            },
            pin_threads: true,
            poll,
            seed: self.seed.unwrap_or_else(rand::random),
            shared_loss_state: !self.per_port_loss_state,
            burst: self.burst,
            delay_queue_capacity: self.delay_queue_capacity,
            egress_queue_capacity: self.egress_queue_capacity,
            pool_size: self.pool_size.unwrap_or_else(|| {
                default_pool_size(self.delay_queue_capacity, self.egress_queue_capacity)
            }),
            stats_interval: (self.stats_interval_secs > 0)
                .then(|| Duration::from_secs(self.stats_interval_secs)),
            link_wait: Duration::from_secs(self.link_wait_secs),
            links,
        };
        config.validate()?;
        Ok(config)
    }
}
