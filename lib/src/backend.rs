//! Message-driven propagation service.
//!
//! A handler thread owns the current body snapshot and turns requests into
//! tasks on a [`TaskPool`]. Every task streams its results back over the
//! response channel, tagged with the subject and sequence number it was
//! submitted under. Consumers run responses through a [`SequenceGate`] to
//! drop anything that a newer request has superseded.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use color_eyre::eyre::{self, OptionExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace};

use crate::{
    bodies::{BodyStateUpdate, SolarSystem},
    error::{Error, PropagationError},
    kepler::orbits::StateVector,
    maneuver::{
        hohmann::{self, HohmannTransfer, TargetOrbit},
        ManeuverMode,
    },
    propagation::{
        ground_track, GroundPoint, Observer, PropagationSettings, Propagator, Sampling,
    },
    satellite::{Satellite, SatelliteId, TrajectorySample},
    soi::SoiEvent,
    time::Epoch,
};

/// What a stream of results is for. Each satellite can have one request in
/// flight per channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Trajectory,
    GroundTrack,
    ManeuverPreview,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub satellite: SatelliteId,
    pub channel: Channel,
}

impl Subject {
    pub fn new(satellite: SatelliteId, channel: Channel) -> Self {
        Self { satellite, channel }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Points {
    Samples(Vec<TrajectorySample>),
    /// [`TrajectorySample::STRIDE`] values per sample.
    Packed(Vec<f64>),
}

impl Points {
    fn new(samples: &[TrajectorySample], packed: bool) -> Self {
        if packed {
            let mut buf = Vec::with_capacity(samples.len() * TrajectorySample::STRIDE);
            for s in samples {
                s.pack_into(&mut buf);
            }
            Self::Packed(buf)
        } else {
            Self::Samples(samples.to_vec())
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Samples(s) => s.len(),
            Self::Packed(buf) => buf.len() / TrajectorySample::STRIDE,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_samples(&self) -> Vec<TrajectorySample> {
        match self {
            Self::Samples(s) => s.clone(),
            Self::Packed(buf) => buf
                .chunks_exact(TrajectorySample::STRIDE)
                .filter_map(TrajectorySample::unpack)
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PropagateRequest {
    pub subject: SatelliteId,
    pub satellite: Satellite,
    pub start: Epoch,
    pub duration: f64,
    pub sampling: Sampling,
    /// Overrides the configured perturbation scale for this request.
    pub perturbation_scale: Option<f64>,
    pub sequence: u64,
    pub packed: bool,
}

#[derive(Clone, Debug)]
pub enum Request {
    Init {
        system: SolarSystem,
        settings: PropagationSettings,
    },
    Propagate(PropagateRequest),
    GroundTrack(PropagateRequest),
    /// Propagate with the satellite's queued nodes, plus a planned transfer
    /// if a target is given, without consuming anything.
    ManeuverPreview {
        request: PropagateRequest,
        target: Option<TargetOrbit>,
    },
    /// Cancel and forget in-flight work for one subject, or for all.
    Reset(Option<Subject>),
    UpdateBodies(Vec<BodyStateUpdate>),
    Shutdown,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    Initialized,
    Progress {
        subject: Subject,
        sequence: u64,
        fraction: f64,
    },
    Update {
        subject: Subject,
        sequence: u64,
        points: Points,
        transitions: Vec<SoiEvent>,
        done: bool,
    },
    GroundTrack {
        subject: Subject,
        sequence: u64,
        points: Vec<GroundPoint>,
        done: bool,
    },
    ManeuverPlan {
        subject: Subject,
        sequence: u64,
        transfer: HohmannTransfer,
    },
    Error {
        subject: Option<Subject>,
        sequence: u64,
        message: String,
        last_sample: Option<TrajectorySample>,
    },
    ResetDone(Option<Subject>),
    BodiesUpdated,
}

impl Response {
    /// Subject, sequence and whether this closes its stream.
    pub fn tag(&self) -> Option<(Subject, u64, bool)> {
        match *self {
            Self::Progress {
                subject, sequence, ..
            } => Some((subject, sequence, false)),
            Self::ManeuverPlan {
                subject, sequence, ..
            } => Some((subject, sequence, false)),
            Self::Update {
                subject,
                sequence,
                done,
                ..
            }
            | Self::GroundTrack {
                subject,
                sequence,
                done,
                ..
            } => Some((subject, sequence, done)),
            Self::Error {
                subject: Some(subject),
                sequence,
                ..
            } => Some((subject, sequence, true)),
            _ => None,
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of worker threads pulling jobs off a shared queue.
pub struct TaskPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    pub fn new(size: usize) -> eyre::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..size.max(1))
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("satprop-worker-{i}"))
                    .spawn(move || loop {
                        let job = rx.lock().recv();
                        match job {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            tx: Some(tx),
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) -> eyre::Result<()> {
        self.tx
            .as_ref()
            .ok_or_eyre("task pool is shut down")?
            .send(Box::new(job))
            .map_err(|_| eyre::eyre!("task pool workers have exited"))
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.tx = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

/// Newest request seen for a subject. The flag is dropped once that
/// request has finished.
struct InFlight {
    sequence: u64,
    cancel: Option<Arc<AtomicBool>>,
}

impl InFlight {
    fn cancel(&self) {
        if let Some(flag) = &self.cancel {
            flag.store(true, Ordering::Relaxed);
        }
    }
}

/// Work per subject. A newer request cancels the older one, and requests
/// older than the newest seen never start.
#[derive(Default)]
struct Registry {
    inner: Mutex<HashMap<Subject, InFlight>>,
}

impl Registry {
    /// Register a request, returning its cancel flag, or `None` if a request
    /// at least as new is already known.
    fn begin(&self, subject: Subject, sequence: u64) -> Option<Arc<AtomicBool>> {
        let mut inner = self.inner.lock();
        if let Some(prev) = inner.get(&subject) {
            if prev.sequence >= sequence {
                return None;
            }
            trace!(?subject, old = prev.sequence, new = sequence, "superseding request");
            prev.cancel();
        }
        let cancel = Arc::new(AtomicBool::new(false));
        inner.insert(
            subject,
            InFlight {
                sequence,
                cancel: Some(cancel.clone()),
            },
        );
        Some(cancel)
    }

    fn finish(&self, subject: Subject, sequence: u64) {
        let mut inner = self.inner.lock();
        if let Some(f) = inner.get_mut(&subject).filter(|f| f.sequence == sequence) {
            f.cancel = None;
        }
    }

    fn reset(&self, subject: Option<Subject>) {
        let mut inner = self.inner.lock();
        match subject {
            Some(subject) => {
                if let Some(f) = inner.remove(&subject) {
                    f.cancel();
                }
            }
            None => {
                for (_, f) in inner.drain() {
                    f.cancel();
                }
            }
        }
    }
}

/// Streams a running propagation back to the requester.
struct Stream {
    tx: Sender<Response>,
    subject: Subject,
    sequence: u64,
    packed: bool,
    cancel: Arc<AtomicBool>,
    forward_samples: bool,
}

impl Observer for Stream {
    fn progress(&mut self, fraction: f64) {
        let _ = self.tx.send(Response::Progress {
            subject: self.subject,
            sequence: self.sequence,
            fraction,
        });
    }

    fn chunk(&mut self, samples: &[TrajectorySample]) {
        if self.forward_samples {
            let _ = self.tx.send(Response::Update {
                subject: self.subject,
                sequence: self.sequence,
                points: Points::new(samples, self.packed),
                transitions: Vec::new(),
                done: false,
            });
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

impl Stream {
    fn fail(&self, err: &PropagationError) {
        let _ = self.tx.send(Response::Error {
            subject: Some(self.subject),
            sequence: self.sequence,
            message: format!("{}", err.source),
            last_sample: err.last_sample,
        });
    }
}

/// What a finished propagation is turned into.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Output {
    Trajectory,
    GroundTrack,
}

struct Context {
    system: Arc<SolarSystem>,
    settings: PropagationSettings,
    registry: Arc<Registry>,
    tx: Sender<Response>,
}

fn submit(
    ctx: &Context,
    pool: &TaskPool,
    request: PropagateRequest,
    channel: Channel,
    target: Option<TargetOrbit>,
) -> eyre::Result<()> {
    let subject = Subject::new(request.subject, channel);
    let Some(cancel) = ctx.registry.begin(subject, request.sequence) else {
        trace!(?subject, sequence = request.sequence, "dropping stale request");
        return Ok(());
    };

    let system = ctx.system.clone();
    let mut settings = ctx.settings.clone();
    if let Some(scale) = request.perturbation_scale {
        settings.perturbation_scale = scale;
    }
    if channel == Channel::ManeuverPreview {
        settings.maneuver_mode = ManeuverMode::Preview;
    }
    let registry = ctx.registry.clone();
    let output = if channel == Channel::GroundTrack {
        Output::GroundTrack
    } else {
        Output::Trajectory
    };
    let mut stream = Stream {
        tx: ctx.tx.clone(),
        subject,
        sequence: request.sequence,
        packed: request.packed,
        cancel,
        forward_samples: output == Output::Trajectory,
    };

    pool.spawn(move || {
        let PropagateRequest {
            mut satellite,
            start,
            duration,
            sampling,
            sequence,
            ..
        } = request;
        let chunk_size = settings.chunk_size.max(1);

        if let Some(target) = target {
            let central = match system.body(satellite.central) {
                Ok(b) => b,
                Err(err) => {
                    stream.fail(&PropagationError::from(err));
                    registry.finish(subject, sequence);
                    return;
                }
            };
            let sv = StateVector {
                central: central.id,
                mu: central.mu,
                position: satellite.position,
                velocity: satellite.velocity,
                epoch: start,
            };
            match hohmann::plan(&sv, &target) {
                Ok(transfer) => {
                    satellite.maneuvers.extend(transfer.nodes(&sv, satellite.id));
                    let _ = stream.tx.send(Response::ManeuverPlan {
                        subject,
                        sequence,
                        transfer,
                    });
                }
                Err(err) => {
                    stream.fail(&PropagationError::from(err));
                    registry.finish(subject, sequence);
                    return;
                }
            }
        }

        let propagator = Propagator::new(&system, settings);
        let result = propagator.propagate(&satellite, start, duration, sampling, &mut stream);
        match result {
            Err(err) => {
                debug!(?subject, sequence, %err, "propagation failed");
                stream.fail(&err);
            }
            Ok(_) if stream.cancelled() => {
                trace!(?subject, sequence, "cancelled, discarding result");
            }
            Ok(traj) if output == Output::GroundTrack => {
                match ground_track(&system, start, &traj.samples) {
                    Ok((points, _)) => {
                        let mut chunks = points.chunks(chunk_size).peekable();
                        if chunks.peek().is_none() {
                            let _ = stream.tx.send(Response::GroundTrack {
                                subject,
                                sequence,
                                points: Vec::new(),
                                done: true,
                            });
                        }
                        while let Some(chunk) = chunks.next() {
                            let _ = stream.tx.send(Response::GroundTrack {
                                subject,
                                sequence,
                                points: chunk.to_vec(),
                                done: chunks.peek().is_none(),
                            });
                        }
                    }
                    Err(err) => stream.fail(&PropagationError::from(err)),
                }
            }
            Ok(traj) => {
                let _ = stream.tx.send(Response::Update {
                    subject,
                    sequence,
                    points: Points::new(&[], stream.packed),
                    transitions: traj.transitions,
                    done: true,
                });
            }
        }
        registry.finish(subject, sequence);
    })
}

/// Request loop. Runs until [`Request::Shutdown`] or until the request
/// channel closes.
#[allow(clippy::needless_pass_by_value)]
pub fn handler_thread(rx: Receiver<Request>, tx: Sender<Response>, pool: TaskPool) {
    let registry = Arc::new(Registry::default());
    let mut system: Option<Arc<SolarSystem>> = None;
    let mut settings = PropagationSettings::default();

    while let Ok(req) = rx.recv() {
        if matches!(req, Request::Shutdown) {
            break;
        }
        let tag = match &req {
            Request::Propagate(r) => Some((Subject::new(r.subject, Channel::Trajectory), r.sequence)),
            Request::GroundTrack(r) => Some((Subject::new(r.subject, Channel::GroundTrack), r.sequence)),
            Request::ManeuverPreview { request: r, .. } => {
                Some((Subject::new(r.subject, Channel::ManeuverPreview), r.sequence))
            }
            _ => None,
        };
        let res = (|| -> eyre::Result<Option<Response>> {
            match req {
                Request::Init {
                    system: new_system,
                    settings: new_settings,
                } => {
                    info!(bodies = new_system.len(), epoch = %new_system.epoch, "initialized");
                    registry.reset(None);
                    system = Some(Arc::new(new_system));
                    settings = new_settings;
                    Ok(Some(Response::Initialized))
                }
                Request::Propagate(request) => {
                    let ctx = context(&system, &settings, &registry, &tx)?;
                    submit(&ctx, &pool, request, Channel::Trajectory, None)?;
                    Ok(None)
                }
                Request::GroundTrack(request) => {
                    let ctx = context(&system, &settings, &registry, &tx)?;
                    submit(&ctx, &pool, request, Channel::GroundTrack, None)?;
                    Ok(None)
                }
                Request::ManeuverPreview { request, target } => {
                    let ctx = context(&system, &settings, &registry, &tx)?;
                    submit(&ctx, &pool, request, Channel::ManeuverPreview, target)?;
                    Ok(None)
                }
                Request::Reset(subject) => {
                    registry.reset(subject);
                    Ok(Some(Response::ResetDone(subject)))
                }
                Request::UpdateBodies(updates) => {
                    let current = system.as_ref().ok_or(Error::NotInitialized)?;
                    let mut next = SolarSystem::clone(current);
                    next.update_states(&updates)?;
                    debug!(bodies = updates.len(), "updated body states");
                    system = Some(Arc::new(next));
                    Ok(Some(Response::BodiesUpdated))
                }
                Request::Shutdown => Ok(None),
            }
        })();

        match res {
            Ok(Some(response)) => {
                if tx.send(response).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => {
                error!(%err, "request failed");
                let response = Response::Error {
                    subject: tag.map(|(subject, _)| subject),
                    sequence: tag.map_or(0, |(_, sequence)| sequence),
                    message: format!("{err:#}"),
                    last_sample: None,
                };
                if tx.send(response).is_err() {
                    break;
                }
            }
        }
    }
    registry.reset(None);
    info!("backend stopped");
}

fn context(
    system: &Option<Arc<SolarSystem>>,
    settings: &PropagationSettings,
    registry: &Arc<Registry>,
    tx: &Sender<Response>,
) -> eyre::Result<Context> {
    Ok(Context {
        system: system.clone().ok_or(Error::NotInitialized)?,
        settings: settings.clone(),
        registry: registry.clone(),
        tx: tx.clone(),
    })
}

/// Drops responses from requests that have been superseded.
///
/// Streamed responses are accepted while their sequence is the newest seen
/// for the subject. Once a stream completes, nothing at or below its
/// sequence gets through again.
#[derive(Clone, Debug, Default)]
pub struct SequenceGate {
    newest: HashMap<Subject, u64>,
    completed: HashMap<Subject, u64>,
}

impl SequenceGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, subject: Subject, sequence: u64, done: bool) -> bool {
        if self.completed.get(&subject).is_some_and(|&c| sequence <= c) {
            trace!(?subject, sequence, "stale result after completion");
            return false;
        }
        let newest = self.newest.entry(subject).or_insert(sequence);
        if sequence < *newest {
            trace!(?subject, sequence, newest = *newest, "stale result");
            return false;
        }
        *newest = sequence;
        if done {
            self.completed.insert(subject, sequence);
        }
        true
    }

    /// Whether a response should reach the consumer. Untagged responses
    /// always do.
    pub fn admit_response(&mut self, response: &Response) -> bool {
        match response.tag() {
            Some((subject, sequence, done)) => self.admit(subject, sequence, done),
            None => true,
        }
    }
}

/// Client side of the backend: owns the handler thread and gates its
/// responses.
pub struct Backend {
    tx: Sender<Request>,
    rx: Receiver<Response>,
    handle: Option<JoinHandle<()>>,
    gate: SequenceGate,
    sequences: HashMap<SatelliteId, u64>,
}

impl Backend {
    pub fn spawn(pool: TaskPool) -> eyre::Result<Self> {
        let (req_tx, req_rx) = mpsc::channel();
        let (res_tx, res_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("satprop-handler".into())
            .spawn(move || handler_thread(req_rx, res_tx, pool))?;
        Ok(Self {
            tx: req_tx,
            rx: res_rx,
            handle: Some(handle),
            gate: SequenceGate::new(),
            sequences: HashMap::new(),
        })
    }

    /// Next sequence number for requests about `satellite`.
    pub fn next_sequence(&mut self, satellite: SatelliteId) -> u64 {
        let seq = self.sequences.entry(satellite).or_insert(0);
        *seq += 1;
        *seq
    }

    pub fn send(&self, request: Request) -> eyre::Result<()> {
        self.tx
            .send(request)
            .map_err(|_| eyre::eyre!("backend handler has exited"))
    }

    /// Next response that is not stale. Blocks.
    pub fn recv(&mut self) -> eyre::Result<Response> {
        loop {
            let response = self
                .rx
                .recv()
                .map_err(|_| eyre::eyre!("backend handler has exited"))?;
            if self.gate.admit_response(&response) {
                return Ok(response);
            }
        }
    }

    /// Like [`Self::recv`], giving up after `timeout`.
    pub fn recv_timeout(&mut self, timeout: Duration) -> eyre::Result<Option<Response>> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(left) {
                Ok(response) if self.gate.admit_response(&response) => return Ok(Some(response)),
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(eyre::eyre!("backend handler has exited"))
                }
            }
        }
    }

    /// Like [`Self::recv`], without blocking.
    pub fn try_recv(&mut self) -> Option<Response> {
        while let Ok(response) = self.rx.try_recv() {
            if self.gate.admit_response(&response) {
                return Some(response);
            }
        }
        None
    }

    pub fn shutdown(mut self) -> eyre::Result<()> {
        let _ = self.tx.send(Request::Shutdown);
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| eyre::eyre!("backend handler panicked"))?;
        }
        Ok(())
    }
}
