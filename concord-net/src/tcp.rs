// TCP rendition of the fabric, newline-delimited JSON both between replicas
// and on the client side.
//
// The peer channel keeps the publish/subscribe shape: every replica binds
// its own publish address and writes each broadcast to every subscriber that
// has connected; to receive, a replica connects to every peer's publish
// address and merges the per-peer streams. One TCP connection per directed
// pair gives FIFO per sender-receiver, and a replica does not subscribe to
// itself, so nothing loops back.
//
// Replicas come up in any order, so every outbound connect retries with a
// bounded exponential back-off before turning fatal.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use concord_base::{err, Result};

use crate::{ClientEndpoint, ClientRequest, PeerMsg, Publisher, ReplySlot, Subscription};

const CONNECT_ATTEMPTS: u32 = 12;
const CONNECT_BASE_DELAY: Duration = Duration::from_millis(50);
const CONNECT_MAX_DELAY: Duration = Duration::from_millis(1600);

pub fn connect_with_backoff(addr: SocketAddr) -> Result<TcpStream> {
    let mut delay = CONNECT_BASE_DELAY;
    for attempt in 1..=CONNECT_ATTEMPTS {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                warn!(target: "concord", "connect to {} failed (attempt {}/{}): {}",
                      addr, attempt, CONNECT_ATTEMPTS, e);
                thread::sleep(delay);
                delay = (delay * 2).min(CONNECT_MAX_DELAY);
            }
        }
    }
    Err(err(format!("gave up connecting to {addr}")))
}

pub struct TcpPublisher {
    subscribers: Arc<Mutex<Vec<TcpStream>>>,
}

impl TcpPublisher {
    // Bind the publish address and accept subscribers in the background.
    // Returns the bound address so callers may bind port 0.
    pub fn bind(addr: SocketAddr) -> Result<(TcpPublisher, SocketAddr)> {
        let listener = TcpListener::bind(addr)?;
        let local = listener.local_addr()?;
        let subscribers = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::clone(&subscribers);
        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(s) => {
                        let _ = s.set_nodelay(true);
                        debug!(target: "concord", "subscriber connected to {}", local);
                        accepted.lock().unwrap().push(s);
                    }
                    Err(e) => warn!(target: "concord", "accept on {} failed: {}", local, e),
                }
            }
        });
        Ok((TcpPublisher { subscribers }, local))
    }

    // Block until `count` subscribers have connected. Replicas come up in
    // any order; a replica must not start proposing before every peer is
    // listening, or those broadcasts are simply gone.
    pub fn await_subscribers(&self, count: usize) -> Result<()> {
        let deadline = std::time::Instant::now() + Duration::from_secs(20);
        loop {
            if self.subscribers.lock().unwrap().len() >= count {
                return Ok(());
            }
            if std::time::Instant::now() > deadline {
                return Err(err("timed out waiting for peer subscribers"));
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Publisher for TcpPublisher {
    fn publish(&self, msg: &PeerMsg) -> Result<()> {
        let mut line = serde_json::to_string(msg)?;
        line.push('\n');
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain_mut(|s| match s.write_all(line.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "concord", "dropping dead subscriber: {}", e);
                false
            }
        });
        Ok(())
    }
}

pub struct TcpSubscription {
    rx: mpsc::Receiver<PeerMsg>,
}

impl TcpSubscription {
    // Connect to every peer's publish address; one reader thread per peer
    // funnels parsed messages into a single merged stream. Order across
    // peers is arbitrary, order within a peer is the order it published.
    pub fn connect(peers: &[SocketAddr]) -> Result<TcpSubscription> {
        let (tx, rx) = mpsc::channel();
        for &addr in peers {
            let stream = connect_with_backoff(addr)?;
            let tx = tx.clone();
            thread::spawn(move || read_peer_lines(stream, addr, tx));
        }
        Ok(TcpSubscription { rx })
    }
}

fn read_peer_lines(stream: TcpStream, addr: SocketAddr, tx: mpsc::Sender<PeerMsg>) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!(target: "concord", "peer stream {} failed: {}", addr, e);
                return;
            }
        };
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<PeerMsg>(&line) {
            Ok(msg) => {
                if tx.send(msg).is_err() {
                    return;
                }
            }
            // Unparseable peer input is logged and dropped, never fatal.
            Err(e) => {
                error!(target: "concord", "dropping malformed peer message from {}: {}", addr, e)
            }
        }
    }
}

impl Subscription for TcpSubscription {
    fn next(&mut self) -> Result<PeerMsg> {
        Ok(self.rx.recv()?)
    }
}

pub struct TcpClientEndpoint {
    rx: mpsc::Receiver<(ClientRequest, ReplySlot)>,
}

impl TcpClientEndpoint {
    pub fn bind(addr: SocketAddr) -> Result<(TcpClientEndpoint, SocketAddr)> {
        let listener = TcpListener::bind(addr)?;
        let local = listener.local_addr()?;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(s) => {
                        let tx = tx.clone();
                        thread::spawn(move || serve_client(s, tx));
                    }
                    Err(e) => warn!(target: "concord", "accept on {} failed: {}", local, e),
                }
            }
        });
        Ok((TcpClientEndpoint { rx }, local))
    }
}

// One connection, one client, strictly lock-step: read a request, hand it
// inward, wait for its reply, write the reply back, repeat. A client that
// sends something unparseable is disconnected rather than left hanging.
fn serve_client(stream: TcpStream, tx: mpsc::Sender<(ClientRequest, ReplySlot)>) {
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            warn!(target: "concord", "client stream clone failed: {}", e);
            return;
        }
    };
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!(target: "concord", "client stream failed: {}", e);
                return;
            }
        };
        if line.is_empty() {
            continue;
        }
        let req = match serde_json::from_str::<ClientRequest>(&line) {
            Ok(r) => r,
            Err(e) => {
                error!(target: "concord", "disconnecting client after malformed request: {}", e);
                return;
            }
        };
        let (slot, reply_rx) = ReplySlot::pair();
        if tx.send((req, slot)).is_err() {
            return;
        }
        let reply = match reply_rx.recv() {
            Ok(r) => r,
            Err(_) => return,
        };
        if let Err(e) = writer.write_all(format!("{reply}\n").as_bytes()) {
            warn!(target: "concord", "client reply write failed: {}", e);
            return;
        }
    }
}

impl ClientEndpoint for TcpClientEndpoint {
    fn next(&mut self) -> Result<(ClientRequest, ReplySlot)> {
        Ok(self.rx.recv()?)
    }
}

// Driver-side handle for one replica's client port.
pub struct TcpClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl TcpClient {
    pub fn connect(addr: SocketAddr) -> Result<TcpClient> {
        let stream = connect_with_backoff(addr)?;
        let writer = stream.try_clone()?;
        Ok(TcpClient {
            reader: BufReader::new(stream),
            writer,
        })
    }

    // One round trip. Does not return until the reply line arrives.
    pub fn request(&mut self, req: &ClientRequest) -> Result<String> {
        let mut line = serde_json::to_string(req)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes())?;
        let mut reply = String::new();
        if self.reader.read_line(&mut reply)? == 0 {
            return Err(err("replica closed the client connection"));
        }
        Ok(reply.trim_end().to_string())
    }
}
