use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use crate::ctrl::{regs, RegisterIface};
use crate::error::TransportError;

fn unix_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Advisory exclusive ownership of a device.
///
/// The claim is a token plus a timestamp in device registers, refreshed periodically by a
///  background task. Another process finding a fresh claim with a different token refuses to
///  configure the device; a claim that was not refreshed within the staleness timeout is taken
///  over.
pub struct Claimer {
    iface: Arc<dyn RegisterIface>,
    token: u32,
    cancel: CancellationToken,
}

#[cfg(test)]
impl std::fmt::Debug for Claimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Claimer").field("token", &self.token).finish_non_exhaustive()
    }
}

impl Claimer {
    pub async fn claim(iface: Arc<dyn RegisterIface>, refresh_interval: Duration, staleness_timeout: Duration) -> anyhow::Result<Claimer> {
        let token = rand::random::<u32>() | 1;

        let holder = iface.peek32(regs::CLAIM_TOKEN).await?;
        if holder != 0 && holder != token {
            let last_refresh = iface.peek32(regs::CLAIM_TIME).await? as u64;
            let age = unix_secs().saturating_sub(last_refresh);
            if age < staleness_timeout.as_secs() {
                return Err(TransportError::ClaimConflict {
                    token: holder,
                    stale_after_secs: staleness_timeout.as_secs() - age,
                }.into());
            }
            info!("taking over stale device claim {:#010x} (last refreshed {}s ago)", holder, age);
        }

        Self::write_claim(iface.as_ref(), token).await?;
        debug!("claimed device with token {:#010x}", token);

        let cancel = CancellationToken::new();
        tokio::spawn(Self::refresh_loop(iface.clone(), token, refresh_interval, cancel.clone()));

        Ok(Claimer { iface, token, cancel })
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    /// Stop refreshing and clear the claim so that other processes can take the device right away
    pub async fn release(self) -> anyhow::Result<()> {
        self.cancel.cancel();
        self.iface.poke32(regs::CLAIM_TOKEN, 0).await?;
        self.iface.poke32(regs::CLAIM_TIME, 0).await?;
        debug!("released device claim {:#010x}", self.token);
        Ok(())
    }

    async fn write_claim(iface: &dyn RegisterIface, token: u32) -> anyhow::Result<()> {
        iface.poke32(regs::CLAIM_TIME, unix_secs() as u32).await?;
        iface.poke32(regs::CLAIM_TOKEN, token).await
    }

    async fn refresh_loop(iface: Arc<dyn RegisterIface>, token: u32, refresh_interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(refresh_interval) => {}
            }

            match iface.peek32(regs::CLAIM_TOKEN).await {
                Ok(holder) if holder != token => warn!("device claim was taken over by {:#010x}", holder),
                Ok(_) => {}
                Err(e) => warn!("error checking device claim: {}", e),
            }
            if let Err(e) = Self::write_claim(iface.as_ref(), token).await {
                warn!("error refreshing device claim: {}", e);
            }
        }
        debug!("device claim refresh stopped");
    }
}

impl Drop for Claimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
