use std::time::Duration;

use tokio::sync::watch;

/// Signal shared by the coordinator and its driver task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Control {
    pub epoch: u64,
    pub stop: bool,
}

impl Control {
    fn interrupts(&self, epoch: u64) -> bool {
        self.stop || self.epoch != epoch
    }
}

/// Sleep for `delay` unless the batch tagged `epoch` is stopped, cleared or
/// replaced first.  Returns `true` if the full delay elapsed.
pub(crate) async fn pace(
    delay: Duration,
    control: &mut watch::Receiver<Control>,
    epoch: u64,
) -> bool {
    if control.borrow_and_update().interrupts(epoch) {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = control.wait_for(|c| c.interrupts(epoch)) => false,
    }
}
