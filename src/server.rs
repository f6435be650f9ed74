use crate::collection::into_collection;
use crate::command::{Request, Response};
use crate::engine::{FileStore, Persistence};
use crate::thread_pool::ThreadPool;
use crate::{Result, Service, SnapshotId, StoreError};
use serde::Serialize;
use serde_json::{json, Deserializer, Value};
use std::io::{BufReader, BufWriter, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// A TCP socket server in front of a prediction store [`Service`].
/// It listens for incoming [`Request`]s on a [`SocketAddr`](https://doc.rust-lang.org/std/net/enum.SocketAddr.html),
/// deserializes the request, and then processes the request on a thread of the pool.
///
/// Every request is first admitted against the rate limiter of its operation class, using the
/// peer's IP address as the client id.
///
/// # Example
/// Create and run a new server listening on "127.0.0.1:4000", with 4 threads running on a Rayon
/// Thread Pool, keeping its data in `./predstore_data`
/// ```rust
/// use predstore::{PredictionServer, Service, StoreConfig};
/// use predstore::thread_pool::{RayonThreadPool, ThreadPool};
/// # use std::error::Error;
/// # fn main() -> Result<(), Box<dyn Error>> {
/// let pool = RayonThreadPool::new(4)?; // create a rayon thread pool with 4 threads
/// let service = Service::open(StoreConfig::default())?;
/// service.start()?; // warm the cache and schedule backups
/// let server = PredictionServer::new(service, pool);
/// // start the server
/// //server.run("127.0.0.1:4000")?;
/// #
/// # Ok(())
/// # }
/// ```
pub struct PredictionServer<P: ThreadPool, S: Persistence = FileStore> {
    /// the store every request is served from
    service: Service<S>,
    /// a pool of threads that will serve connections using a handle to the store
    pool: P,
    /// set by a [`StopHandle`] to end the accept loop
    stopped: Arc<AtomicBool>,
}

/// Stops a running [`PredictionServer`] from another thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    /// Asks the server listening on `addr` to stop. The server finishes the accept it is blocked
    /// in, leaves its accept loop and drains the store's background tasks.
    pub fn stop<A: ToSocketAddrs>(&self, addr: A) {
        self.stopped.store(true, Ordering::SeqCst);
        // wake up the blocking accept
        if let Err(e) = TcpStream::connect(addr) {
            debug!("server already gone: {}", e);
        }
    }
}

impl<P: ThreadPool, S: Persistence> PredictionServer<P, S> {
    /// Create a new `PredictionServer` using the given [`Service`] and [`ThreadPool`]
    /// implementation.
    pub fn new(service: Service<S>, pool: P) -> Self {
        PredictionServer {
            service,
            pool,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// a handle that can stop this server once it runs
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stopped: Arc::clone(&self.stopped),
        }
    }

    /// starts a server listening on the given address.
    /// Each connection that comes in gets serviced on a thread from the ThreadPool.
    ///
    /// Returns once a [`StopHandle`] stopped the server, after the store was shut down (its
    /// recurring backup stopped and its queued background tasks drained).
    ///
    /// # Errors
    /// returns [`StoreError`] if the server could not be started
    pub fn run<A: ToSocketAddrs>(self, addr: A) -> Result<()> {
        let listener = TcpListener::bind(addr)?;
        info!("listening on {}", listener.local_addr()?);
        for stream in listener.incoming() {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let service = self.service.clone();
                    self.pool.spawn(move || {
                        if let Err(e) = serve(service, stream) {
                            error!("Error on serving client: {}", e);
                        }
                    });
                }
                Err(e) => error!("Connection failed: {}", e),
            }
        }
        info!("server stopped, draining background tasks");
        self.service.shutdown();
        Ok(())
    }
}

/// Listens for and processes [`Request`]s coming over the given `tcp` stream
/// This function will: deserialize the request, admit it, execute it against the store,
/// and finally return a [`Response`] to the client on the `tcp` stream
fn serve<S: Persistence>(service: Service<S>, tcp: TcpStream) -> Result<()> {
    let peer_addr = tcp.peer_addr()?;
    let client = peer_addr.ip().to_string();
    let stream_reader = BufReader::new(&tcp);
    let mut stream_writer = BufWriter::new(&tcp);
    let req_reader = Deserializer::from_reader(stream_reader).into_iter::<Request>();

    let mut send_resp = move |resp: Response| -> Result<()> {
        serde_json::to_writer(&mut stream_writer, &resp)?;
        stream_writer.flush()?;
        debug!("Response sent to {}: {:?}", peer_addr, resp);
        Ok(())
    };

    for req in req_reader {
        let req = req?;
        debug!("Receive request from {}: {:?}", peer_addr, req);

        let admitted = match req.operation_class() {
            Some(class) => service.admit(&client, class),
            None => Ok(()),
        };
        let resp = match admitted {
            Ok(()) => match handle(&service, req) {
                Ok(value) => Response::Ok(value),
                Err(e) => Response::Err(format!("{}", e)),
            },
            Err(e) => Response::RateLimited(format!("{}", e)),
        };
        send_resp(resp)?;
    }
    Ok(())
}

/// runs one admitted request against the store
fn handle<S: Persistence>(service: &Service<S>, req: Request) -> Result<Value> {
    match req {
        Request::Get { collection } => Ok(Value::Object(service.get(collection))),
        Request::Put { collection, delta } => {
            service.put(collection, into_collection(delta)?)?;
            Ok(success(format!("{} updated", collection)))
        }
        Request::Backup => {
            let task = service.trigger_backup()?;
            Ok(json!({"status": "success", "message": "Backup creation started", "task": task}))
        }
        Request::Export => {
            let task = service.trigger_export()?;
            Ok(json!({"status": "success", "message": "CSV export started", "task": task}))
        }
        Request::ClearAll => {
            let id = service.clear_all()?;
            Ok(json!({"status": "success", "message": "All data cleared", "backup": id}))
        }
        Request::Restart => {
            let id = service.restart_competition()?;
            Ok(json!({"status": "success", "message": "Competition restarted", "backup": id}))
        }
        Request::Restore { snapshot } => {
            let id: SnapshotId = snapshot.parse()?;
            let previous = service.restore(&id)?;
            Ok(json!({
                "status": "success",
                "message": format!("Data restored from {}", id),
                "backup": previous,
            }))
        }
        Request::Stats => to_value(service.stats()),
        Request::Winners => to_value(service.compute_winners().iter().collect::<Vec<_>>()),
        Request::Snapshots => to_value(service.list_snapshots()?),
        Request::Health => to_value(service.health()),
    }
}

fn success(message: String) -> Value {
    json!({"status": "success", "message": message})
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(StoreError::from)
}
