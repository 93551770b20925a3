// ==========================================
// Wiring: ports, queues, stages
// ==========================================
//
// Per link (a, b):
//
//   a.rx -> Ingress(a) -> delay[a] -> Delay(a) -> egress[b] -> Egress(b) -> b.tx
//   b.rx -> Ingress(b) -> delay[b] -> Delay(b) -> egress[a] -> Egress(a) -> a.tx
//
// Every queue has exactly one producer stage and one consumer stage.

use std::sync::Arc;

use tracing::info;

use crate::clock::Clock;
use crate::config::EmulatorConfig;
use crate::error::RuntimeError;
use crate::impairment::{ChainState, Duplicator, Impairment, SeededDraws};
use crate::link::{PortId, PortTable};
use crate::port::Port;
use crate::rate_limiter::RateLimiter;
use crate::ring::bounded;
use crate::stage::{DelayStage, EgressStage, IngressStage, Shutdown, Stage};
use crate::stats::PathStats;
use crate::token_bucket::TokenBucket;

/// Seed of the draw generator owned by the ingress stage of `port`.
pub fn draw_seed(base: u64, port: PortId) -> u64 {
    base.wrapping_add(port.0 as u64)
}

/// The three stages serving one physical port.
pub struct PortStages<C> {
    pub id: PortId,
    pub name: String,
    pub ingress: IngressStage<C>,
    pub delay: DelayStage<C>,
    pub egress: EgressStage<TokenBucket>,
}

pub struct Pipeline<C> {
    table: PortTable,
    ports: Vec<PortStages<C>>,
    limiter: RateLimiter<C>,
    bucket: Arc<TokenBucket>,
    paths: Vec<Arc<PathStats>>,
}

impl<C: Clock + Clone + 'static> Pipeline<C> {
    /// `ports` must be in configuration order: `a` then `b` of every link.
    pub fn build(
        config: &EmulatorConfig,
        ports: Vec<Arc<dyn Port>>,
        clock: C,
        shutdown: &Shutdown,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        if ports.len() != config.port_count() {
            return Err(RuntimeError::PortCount {
                expected: config.port_count(),
                got: ports.len(),
            });
        }
        for (port, expected) in ports.iter().zip(config.port_names()) {
            if port.name() != expected {
                return Err(RuntimeError::PortName {
                    expected,
                    got: port.name().to_string(),
                });
            }
        }

        let mut table = PortTable::new();
        let mut supplied = ports.into_iter();
        for spec in &config.links {
            let (Some(a), Some(b)) = (supplied.next(), supplied.next()) else {
                break;
            };
            let link = table.add_link(a, b, spec.delay_us, clock.us_to_cycles(spec.delay_us))?;
            info!(
                a = %spec.a,
                b = %spec.b,
                delay_us = link.delay_us,
                delay_cycles = link.delay_cycles,
                "link configured"
            );
        }

        let paths = (0..table.len())
            .map(|i| table.path_label(PortId(i)).map(PathStats::new))
            .collect::<Result<Vec<_>, _>>()?;

        let bucket = Arc::new(TokenBucket::new(config.rate_bps));
        let shared_chain = config.loss.new_chain();
        let chain_for = |_: PortId| -> ChainState {
            if config.shared_loss_state {
                shared_chain.clone()
            } else {
                config.loss.new_chain()
            }
        };

        let mut stages = Vec::with_capacity(table.len());
        for &link in table.links() {
            let (delay_tx_a, delay_rx_a) = bounded(config.delay_queue_capacity);
            let (delay_tx_b, delay_rx_b) = bounded(config.delay_queue_capacity);
            let (egress_tx_a, egress_rx_a) = bounded(config.egress_queue_capacity);
            let (egress_tx_b, egress_rx_b) = bounded(config.egress_queue_capacity);

            let sides = [
                (link.a, delay_tx_a, delay_rx_a, egress_tx_b, egress_rx_a),
                (link.b, delay_tx_b, delay_rx_b, egress_tx_a, egress_rx_b),
            ];
            for (id, delay_tx, delay_rx, peer_egress_tx, egress_rx) in sides {
                let entry = table.get(id)?;
                let peer = table.peer_of(id)?;
                let impairment = Impairment::new(
                    config.loss.instantiate(chain_for(id)),
                    Duplicator::new(config.duplicate),
                    SeededDraws::new(draw_seed(config.seed, id)),
                );
                stages.push(PortStages {
                    id,
                    name: entry.name().to_string(),
                    ingress: IngressStage::new(
                        entry.port.clone(),
                        clock.clone(),
                        impairment,
                        delay_tx,
                        paths[id.0].clone(),
                        config.burst,
                    ),
                    delay: DelayStage::new(
                        clock.clone(),
                        entry.delay_cycles,
                        delay_rx,
                        peer_egress_tx,
                        paths[id.0].clone(),
                        config.burst,
                    ),
                    egress: EgressStage::new(
                        entry.port.clone(),
                        egress_rx,
                        bucket.clone(),
                        paths[peer.0].clone(),
                        shutdown.clone(),
                        config.burst,
                    ),
                });
            }
        }

        info!(
            ports = table.len(),
            loss = config.loss.name(),
            shared_loss_state = config.shared_loss_state,
            duplicate = config.duplicate,
            rate_bps = config.rate_bps,
            seed = config.seed,
            "pipeline built"
        );
        Ok(Self {
            table,
            ports: stages,
            limiter: RateLimiter::new(bucket.clone(), clock),
            bucket,
            paths,
        })
    }

    pub fn table(&self) -> &PortTable {
        &self.table
    }

    pub fn bucket(&self) -> &Arc<TokenBucket> {
        &self.bucket
    }

    /// Statistics of the direction entering at each port, indexed by `PortId`.
    pub fn paths(&self) -> &[Arc<PathStats>] {
        &self.paths
    }

    pub fn path(&self, id: PortId) -> Option<&Arc<PathStats>> {
        self.paths.get(id.0)
    }

    pub fn port_stages(&mut self) -> &mut [PortStages<C>] {
        &mut self.ports
    }

    /// Run every stage once, limiter first, then ingress, delay and egress
    /// per port. Returns the total work done.
    pub fn poll_all(&mut self) -> usize {
        let mut work = 0;
        if self.bucket.rate_bps() != 0 {
            work += self.limiter.poll();
        }
        for p in &mut self.ports {
            work += p.ingress.poll();
            work += p.delay.poll();
        }
        for p in &mut self.ports {
            work += p.egress.poll();
        }
        work
    }

    /// Split into one named stage per core, in core order. The rate limiter
    /// is last and only present when a rate is set.
    pub fn into_stages(self) -> Vec<(String, Box<dyn Stage>)> {
        let mut out: Vec<(String, Box<dyn Stage>)> = Vec::with_capacity(self.ports.len() * 3 + 1);
        for p in self.ports {
            out.push((format!("ingress-{}", p.name), Box::new(p.ingress)));
            out.push((format!("delay-{}", p.name), Box::new(p.delay)));
            out.push((format!("egress-{}", p.name), Box::new(p.egress)));
        }
        if self.bucket.rate_bps() != 0 {
            out.push(("rate-limiter".to_string(), Box::new(self.limiter)));
        }
        out
    }
}
