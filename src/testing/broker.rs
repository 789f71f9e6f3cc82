use std::collections::{HashMap, VecDeque};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const DEFAULT_TUBE: &str = "default";

#[derive(Clone)]
struct StoredJob {
    id: u64,
    priority: u32,
    data: Vec<u8>,
}

#[derive(Default)]
struct Tube {
    ready: VecDeque<StoredJob>,
    buried: Vec<StoredJob>,
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    tubes: HashMap<String, Tube>,
    reserved: HashMap<u64, (String, StoredJob)>,
}

impl BrokerState {
    fn tube(&mut self, name: &str) -> &mut Tube {
        self.tubes.entry(name.to_owned()).or_default()
    }

    fn take_ready(&mut self, watching: &[String]) -> Option<(String, StoredJob)> {
        let mut best: Option<(String, usize, u32, u64)> = None;
        for name in watching {
            let Some(tube) = self.tubes.get(name) else {
                continue;
            };
            for (index, job) in tube.ready.iter().enumerate() {
                let better = match &best {
                    Some((_, _, priority, id)) => (job.priority, job.id) < (*priority, *id),
                    None => true,
                };
                if better {
                    best = Some((name.clone(), index, job.priority, job.id));
                }
            }
        }

        let (name, index, _, _) = best?;
        let job = self.tube(&name).ready.remove(index)?;
        Some((name, job))
    }
}

type Shared = Arc<(Mutex<BrokerState>, Condvar)>;

/// In-process subset of a beanstalkd broker for exercising the client over
/// real sockets.
pub struct FakeBroker {
    port: u16,
    shared: Shared,
    stop: Arc<AtomicBool>,
}

impl FakeBroker {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("fake broker should bind");
        listener
            .set_nonblocking(true)
            .expect("fake broker listener should be non-blocking");
        let port = listener.local_addr().expect("fake broker local addr").port();
        let shared: Shared = Arc::new((Mutex::new(BrokerState::default()), Condvar::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let accept_shared = Arc::clone(&shared);
        let accept_stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !accept_stop.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let shared = Arc::clone(&accept_shared);
                        let stop = Arc::clone(&accept_stop);
                        thread::spawn(move || {
                            let _ = serve_connection(stream, shared, stop);
                        });
                    }
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Self { port, shared, stop }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ready_count(&self, tube: &str) -> usize {
        self.with_state(|state| state.tubes.get(tube).map(|t| t.ready.len()).unwrap_or(0))
    }

    pub fn buried_count(&self, tube: &str) -> usize {
        self.with_state(|state| state.tubes.get(tube).map(|t| t.buried.len()).unwrap_or(0))
    }

    pub fn reserved_count(&self) -> usize {
        self.with_state(|state| state.reserved.len())
    }

    fn with_state<T>(&self, read: impl FnOnce(&BrokerState) -> T) -> T {
        let state = self.shared.0.lock().expect("fake broker lock poisoned");
        read(&state)
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.shared.1.notify_all();
    }
}

fn serve_connection(stream: TcpStream, shared: Shared, stop: Arc<AtomicBool>) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut using = DEFAULT_TUBE.to_owned();
    let mut watching = vec![DEFAULT_TUBE.to_owned()];

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(command) = parts.first().copied() else {
            continue;
        };
        let (lock, condvar) = &*shared;

        let response: Vec<u8> = match command {
            "put" => {
                let priority = parse_arg(&parts, 1) as u32;
                let size = parse_arg(&parts, 4) as usize;
                let mut body = vec![0_u8; size + 2];
                reader.read_exact(&mut body)?;
                body.truncate(size);

                let mut state = lock.lock().expect("fake broker lock poisoned");
                state.next_id += 1;
                let id = state.next_id;
                state.tube(&using).ready.push_back(StoredJob {
                    id,
                    priority,
                    data: body,
                });
                condvar.notify_all();
                format!("INSERTED {id}\r\n").into_bytes()
            }
            "use" => {
                using = parts.get(1).copied().unwrap_or(DEFAULT_TUBE).to_owned();
                lock.lock().expect("fake broker lock poisoned").tube(&using);
                format!("USING {using}\r\n").into_bytes()
            }
            "watch" => {
                let tube = parts.get(1).copied().unwrap_or(DEFAULT_TUBE).to_owned();
                lock.lock().expect("fake broker lock poisoned").tube(&tube);
                if !watching.contains(&tube) {
                    watching.push(tube);
                }
                format!("WATCHING {}\r\n", watching.len()).into_bytes()
            }
            "ignore" => {
                let tube = parts.get(1).copied().unwrap_or_default();
                if watching.len() == 1 && watching[0] == tube {
                    b"NOT_IGNORED\r\n".to_vec()
                } else {
                    watching.retain(|watched| watched != tube);
                    format!("WATCHING {}\r\n", watching.len()).into_bytes()
                }
            }
            "reserve" | "reserve-with-timeout" => {
                let timeout = (command == "reserve-with-timeout")
                    .then(|| Duration::from_secs(parse_arg(&parts, 1)));
                let started = Instant::now();
                let mut state = lock.lock().expect("fake broker lock poisoned");
                loop {
                    if let Some((tube, job)) = state.take_ready(&watching) {
                        let mut response =
                            format!("RESERVED {} {}\r\n", job.id, job.data.len()).into_bytes();
                        response.extend_from_slice(&job.data);
                        response.extend_from_slice(b"\r\n");
                        state.reserved.insert(job.id, (tube, job));
                        break response;
                    }
                    if stop.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    if let Some(timeout) = timeout {
                        if started.elapsed() >= timeout {
                            break b"TIMED_OUT\r\n".to_vec();
                        }
                    }
                    state = condvar
                        .wait_timeout(state, Duration::from_millis(20))
                        .expect("fake broker lock poisoned")
                        .0;
                }
            }
            "delete" => {
                let id = parse_arg(&parts, 1);
                let mut state = lock.lock().expect("fake broker lock poisoned");
                let mut found = state.reserved.remove(&id).is_some();
                for tube in state.tubes.values_mut() {
                    let before = tube.ready.len() + tube.buried.len();
                    tube.ready.retain(|job| job.id != id);
                    tube.buried.retain(|job| job.id != id);
                    found |= before != tube.ready.len() + tube.buried.len();
                }
                if found {
                    b"DELETED\r\n".to_vec()
                } else {
                    b"NOT_FOUND\r\n".to_vec()
                }
            }
            "release" | "bury" => {
                let id = parse_arg(&parts, 1);
                let mut state = lock.lock().expect("fake broker lock poisoned");
                match state.reserved.remove(&id) {
                    Some((tube, mut job)) => {
                        job.priority = parse_arg(&parts, 2) as u32;
                        if command == "release" {
                            state.tube(&tube).ready.push_back(job);
                            condvar.notify_all();
                            b"RELEASED\r\n".to_vec()
                        } else {
                            state.tube(&tube).buried.push(job);
                            b"BURIED\r\n".to_vec()
                        }
                    }
                    None => b"NOT_FOUND\r\n".to_vec(),
                }
            }
            "stats-tube" => {
                let tube = parts.get(1).copied().unwrap_or_default();
                let state = lock.lock().expect("fake broker lock poisoned");
                match state.tubes.get(tube) {
                    Some(stats) => {
                        let body = format!(
                            "---\nname: {tube}\ncurrent-jobs-ready: {}\ncurrent-jobs-buried: {}\n",
                            stats.ready.len(),
                            stats.buried.len()
                        );
                        format!("OK {}\r\n{body}\r\n", body.len()).into_bytes()
                    }
                    None => b"NOT_FOUND\r\n".to_vec(),
                }
            }
            _ => b"UNKNOWN_COMMAND\r\n".to_vec(),
        };

        writer.write_all(&response)?;
        writer.flush()?;
    }
}

fn parse_arg(parts: &[&str], index: usize) -> u64 {
    parts
        .get(index)
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or_default()
}
