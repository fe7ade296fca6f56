//! Progress widget thread.

use std::sync::Arc;
use std::time::Duration;

use crate::agenda::Agenda;

/// Redraws the task counter twice a second until the queue drains.
pub(super) fn progress_loop(agenda: &Arc<Agenda>) {
    loop {
        if !agenda.work_remains() {
            return;
        }
        agenda.draw_progress_widget();
        std::thread::sleep(Duration::from_millis(500));
    }
}
