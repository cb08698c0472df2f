//! Status polling scheduler.
//!
//! Each pass walks every field node and every controller behind it and
//! reads back all in-use channels with as few requests as possible,
//! then reads the weather station sensors. Requests go through the shared
//! [`TransportQueue`] at normal priority so cloud writes overtake them.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use edgelink_bridge_framework::Shutdown;

use crate::config::{PollingConfig, WeatherStationConfig};
use crate::frame::RequestFrame;
use crate::registry::{ControllerProfile, RegisterWidth, Registry};
use crate::transport::{OutboundFrame, Priority, TransportQueue};

/// Start register and count of one weather sensor read.
const WEATHER_READ: (u16, u16) = (0, 2);

/// One read request covering a contiguous run of channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRun {
    pub start: u16,
    pub count: u16,
}

/// Split the in-use channels of one width into contiguous runs of at most
/// `max_run` channels, lowest first.
pub fn plan_reads(profile: &ControllerProfile, width: RegisterWidth, max_run: u16) -> Vec<ReadRun> {
    let channels = profile.channels(width);
    let max_run = max_run.max(1);
    let mut runs = Vec::new();

    let Some(highest) = channels.highest() else {
        return runs;
    };
    let mut cursor = channels.lowest();

    while let Some(start) = cursor {
        let mut count = 1;
        while count < max_run
            && start
                .checked_add(count)
                .is_some_and(|c| channels.contains(c))
        {
            count += 1;
        }
        runs.push(ReadRun { start, count });

        let after = start + count;
        cursor = if after > highest {
            None
        } else {
            channels.next_from(after)
        };
    }

    runs
}

/// A queued read and the pause that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollStep {
    pub devaddr: String,
    pub frame: RequestFrame,
    pub pause: Duration,
}

/// Drives polling passes on a fixed cadence.
pub struct PollingScheduler {
    registry: Arc<Registry>,
    queue: Arc<TransportQueue>,
    polling: PollingConfig,
    weather: Option<WeatherStationConfig>,
}

impl PollingScheduler {
    pub fn new(
        registry: Arc<Registry>,
        queue: Arc<TransportQueue>,
        polling: PollingConfig,
        weather: Option<WeatherStationConfig>,
    ) -> Self {
        Self {
            registry,
            queue,
            polling,
            weather,
        }
    }

    /// Every read of one pass, in send order.
    pub fn plan_pass(&self) -> Vec<PollStep> {
        let mut steps = Vec::new();
        let settle = self.polling.settle();
        let gap = self.polling.controller_gap();

        for node in self.registry.field_nodes() {
            for &address in &node.controllers {
                let Some(profile) = self.registry.lookup_controller(address) else {
                    continue;
                };

                let first = steps.len();
                for width in RegisterWidth::ALL {
                    for run in plan_reads(profile, width, self.polling.max_registers_per_read) {
                        steps.push(PollStep {
                            devaddr: node.devaddr.clone(),
                            frame: RequestFrame::read(address, run.start, run.count),
                            pause: settle,
                        });
                    }
                }

                if steps.len() > first {
                    if let Some(last) = steps.last_mut() {
                        last.pause = gap;
                    }
                }
            }
        }

        if self.polling.poll_weather {
            if let Some(station) = &self.weather {
                let (start, count) = WEATHER_READ;
                for sensor in station.sensor_addresses() {
                    steps.push(PollStep {
                        devaddr: station.devaddr.clone(),
                        frame: RequestFrame::read(sensor, start, count),
                        pause: gap,
                    });
                }
            }
        }

        steps
    }

    /// Run passes until shutdown.
    pub async fn run(self, mut shutdown: Shutdown) {
        if !self.polling.enabled {
            info!("Status polling disabled");
            return;
        }

        let plan = self.plan_pass();
        let interval = self.polling.pass_interval();
        info!(
            "Starting status polling: {} read(s) per pass, pass interval {}s",
            plan.len(),
            interval.as_secs()
        );

        loop {
            for step in &plan {
                debug!(
                    "Poll {} plc={:#04x} start={} count={}",
                    step.devaddr, step.frame.address, step.frame.register, step.frame.value
                );
                self.queue.enqueue(OutboundFrame::new(
                    step.devaddr.as_str(),
                    &step.frame,
                    Priority::Normal,
                ));

                if !pause(step.pause, &mut shutdown).await {
                    return;
                }
            }

            if !pause(interval, &mut shutdown).await {
                return;
            }
        }
    }
}

/// Sleep for `duration`; false if shutdown arrived first.
async fn pause(duration: Duration, shutdown: &mut Shutdown) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.triggered() => {
            debug!("Status polling stopped");
            false
        }
    }
}
