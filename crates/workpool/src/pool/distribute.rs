//! Default pairing of free workers with queued tasks

use super::task::Task;
use crate::worker::Worker;

/// One distribution slot; either side may be empty
pub type Pairing = (Option<Worker>, Option<Task>);

/// Default distribution policy
///
/// Tasks pinned to a worker that is currently free are paired first. The
/// remaining free workers are zipped with the remaining unpinned tasks by
/// position. A pinned task whose worker is busy is left in the queue.
pub fn default_distribution(free: &[Worker], queued: &[Task]) -> Vec<Pairing> {
    let mut claimed: Vec<&Worker> = Vec::new();
    let mut pairs: Vec<Pairing> = Vec::new();

    for task in queued {
        let Some(pinned) = task.pinned_worker() else {
            continue;
        };
        if let Some(worker) = free.iter().find(|w| **w == pinned) {
            if !claimed.contains(&worker) {
                claimed.push(worker);
                pairs.push((Some(worker.clone()), Some(task.clone())));
            }
        }
    }

    let mut unpinned = queued.iter().filter(|task| !task.is_pinned());
    for worker in free.iter().filter(|w| !claimed.contains(w)) {
        pairs.push((Some(worker.clone()), unpinned.next().cloned()));
    }

    pairs
}
