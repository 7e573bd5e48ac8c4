use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use tracing::info;

use concord_base::Result;
use concord_net::tcp::TcpClient;
use concord_net::RequestKind;

use crate::config::ClientSpec;

// One scripted client over one lock-step connection: each request waits for
// its reply before the next goes out, so a script is also a serialization
// of that client's view of the cluster.
pub fn run_script(spec: &ClientSpec, replica: SocketAddr) -> Result<()> {
    let mut conn = TcpClient::connect(replica)?;
    info!(target: "concord", "client {} connected to replica {}", spec.client_number, spec.server_number);
    for req in &spec.requests {
        if req.kind == RequestKind::Sleep {
            // Emulated network delay: stalls the script, nothing on the wire.
            thread::sleep(Duration::from_millis(req.value.max(0) as u64));
            continue;
        }
        info!(target: "concord", "client {} sent {:?}", spec.client_number, req);
        let reply = conn.request(req)?;
        info!(target: "concord", "client {} received {:?}", spec.client_number, reply);
    }
    Ok(())
}
