use std::sync::Mutex;

use concord_net::Stamp;

// The Lamport scalar for one replica. tick() stamps a send event, observe()
// folds in the stamp of a receive event; they are the only mutators, and
// both return the new value, so the clock never runs backwards (the mutex
// makes the read-modify-write of concurrent reactors atomic).
pub struct LamportClock {
    now: Mutex<Stamp>,
}

impl LamportClock {
    pub fn new() -> LamportClock {
        LamportClock {
            now: Mutex::new(Stamp::default()),
        }
    }

    pub fn tick(&self) -> Stamp {
        let mut now = self.now.lock().unwrap();
        *now = now.next();
        *now
    }

    pub fn observe(&self, seen: Stamp) -> Stamp {
        let mut now = self.now.lock().unwrap();
        *now = (*now).max(seen).next();
        *now
    }
}

impl Default for LamportClock {
    fn default() -> Self {
        Self::new()
    }
}
