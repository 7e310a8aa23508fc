//! The process group of a data parallel run.
//!
//! Rank 0 hosts a hub every other rank connects to. Collectives are star
//! shaped: the hub receives one frame from every peer in rank order, combines
//! them and sends the result back.

use std::{env, io, time::Duration};

use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg, Payload},
};
use log::{debug, info, warn};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::{Builder, Runtime},
};

use crate::{FinetuneErr, Result, config::DistArgs};

type NetRx = OnoReceiver<OwnedReadHalf>;
type NetTx = OnoSender<OwnedWriteHalf>;

const CONNECT_ATTEMPTS: usize = 100;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";

enum Link {
    /// Rank 0, holding one channel per peer ordered by rank.
    Hub(Vec<(NetRx, NetTx)>),
    Peer(NetRx, NetTx),
}

struct Group {
    runtime: Runtime,
    link: Link,
    rx_buf: Vec<u32>,
}

/// This process' place in the process group.
pub struct DistContext {
    rank: usize,
    world_size: usize,
    local_rank: Option<usize>,
    group: Option<Group>,
}

fn env_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| FinetuneErr::InvalidConfig(format!("{name}={value} is not valid"))),
        Err(_) => Ok(None),
    }
}

fn dist_err(e: io::Error) -> FinetuneErr {
    FinetuneErr::Dist(e.to_string())
}

impl DistContext {
    /// A group of one, every collective is the identity.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: None,
            group: None,
        }
    }

    /// Joins the process group.
    ///
    /// `RANK`, `WORLD_SIZE` and `LOCAL_RANK` take precedence over `args`. The
    /// hub address comes from `tcp://host:port`, or from `MASTER_ADDR` and
    /// `MASTER_PORT` for `env://`.
    pub fn init(args: &DistArgs) -> Result<Self> {
        let rank = env_var("RANK")?.unwrap_or(args.rank);
        let world_size = env_var("WORLD_SIZE")?.unwrap_or(args.world_size);
        let local_rank = env_var("LOCAL_RANK")?.or(args.local_rank);

        if world_size <= 1 {
            info!("Not using distributed mode");
            return Ok(Self {
                local_rank,
                ..Self::single()
            });
        }

        if rank >= world_size {
            return Err(FinetuneErr::InvalidConfig(format!(
                "rank {rank} is out of a world of {world_size}"
            )));
        }

        let addr = Self::hub_addr(&args.dist_url)?;
        info!("| distributed init (rank {rank}): {}", args.dist_url);

        let runtime = Builder::new_current_thread().enable_all().build()?;
        let link = if rank == 0 {
            runtime.block_on(Self::host(&addr, world_size))
        } else {
            runtime.block_on(Self::join(&addr, rank, world_size))
        }
        .map_err(dist_err)?;

        Ok(Self {
            rank,
            world_size,
            local_rank,
            group: Some(Group {
                runtime,
                link,
                rx_buf: Vec::new(),
            }),
        })
    }

    fn hub_addr(dist_url: &str) -> Result<String> {
        if let Some(addr) = dist_url.strip_prefix("tcp://") {
            return Ok(addr.to_string());
        }

        if dist_url == "env://" {
            let host = env::var("MASTER_ADDR").unwrap_or_else(|_| DEFAULT_MASTER_ADDR.to_string());
            let port: u16 = env_var("MASTER_PORT")?.ok_or_else(|| {
                FinetuneErr::InvalidConfig("env:// needs MASTER_PORT to be set".into())
            })?;
            return Ok(format!("{host}:{port}"));
        }

        Err(FinetuneErr::InvalidConfig(format!(
            "unsupported dist_url {dist_url}, expected env:// or tcp://host:port"
        )))
    }

    /// Accepts `world_size - 1` peers and orders them by rank.
    async fn host(addr: &str, world_size: usize) -> io::Result<Link> {
        let listener = TcpListener::bind(addr).await?;
        info!("hub listening at {addr}, waiting for {} peers", world_size - 1);

        let mut slots: Vec<Option<(NetRx, NetTx)>> = (1..world_size).map(|_| None).collect();
        let mut buf: Vec<u32> = Vec::new();

        for _ in 1..world_size {
            let (stream, from) = listener.accept().await?;
            let (rx, tx) = stream.into_split();
            let (mut rx, tx) = comms::channel(rx, tx);

            let joined = match rx.recv_into(&mut buf).await? {
                Msg::Control(Command::Join { rank, world_size: w }) => (rank, w),
                msg => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("expected Join from {from}, got {}", msg.kind()),
                    ));
                }
            };

            let (rank, w) = joined;
            if w != world_size || rank == 0 || rank >= world_size {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{from} joined as rank {rank} of {w}, the hub expects {world_size}"),
                ));
            }

            if slots[rank - 1].replace((rx, tx)).is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("rank {rank} joined twice"),
                ));
            }
            info!("rank {rank} joined from {from}");
        }

        Ok(Link::Hub(slots.into_iter().flatten().collect()))
    }

    /// Connects to the hub, retrying while it is not up yet.
    async fn join(addr: &str, rank: usize, world_size: usize) -> io::Result<Link> {
        let mut attempt = 0;
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) if attempt + 1 < CONNECT_ATTEMPTS => {
                    attempt += 1;
                    if attempt % 10 == 0 {
                        warn!("hub at {addr} unreachable after {attempt} attempts: {e}");
                    }
                    tokio::time::sleep(CONNECT_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        };

        let (rx, tx) = stream.into_split();
        let (rx, mut tx) = comms::channel(rx, tx);
        tx.send(&Msg::Control(Command::Join { rank, world_size }))
            .await?;

        Ok(Link::Peer(rx, tx))
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn local_rank(&self) -> Option<usize> {
        self.local_rank
    }

    pub fn is_distributed(&self) -> bool {
        self.group.is_some()
    }

    /// Only the main process writes logs and checkpoints.
    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }

    /// Replaces `values` with their element-wise mean across every rank.
    pub fn all_reduce_mean(&mut self, values: &mut [f32]) -> Result<()> {
        let Some(Group {
            runtime,
            link,
            rx_buf,
        }) = &mut self.group
        else {
            return Ok(());
        };

        let world = self.world_size as f32;
        runtime
            .block_on(async {
                match link {
                    Link::Hub(peers) => {
                        for (rx, _) in peers.iter_mut() {
                            match rx.recv_into(rx_buf).await? {
                                Msg::Data(Payload::Gradient(g)) if g.len() == values.len() => {
                                    values.iter_mut().zip(g).for_each(|(v, g)| *v += g);
                                }
                                msg => return Err(unexpected("gradient", &msg)),
                            }
                        }

                        values.iter_mut().for_each(|v| *v /= world);

                        let msg = Msg::Data(Payload::Reduced(values));
                        for (_, tx) in peers.iter_mut() {
                            tx.send(&msg).await?;
                        }
                    }
                    Link::Peer(rx, tx) => {
                        tx.send(&Msg::Data(Payload::Gradient(values))).await?;

                        match rx.recv_into(rx_buf).await? {
                            Msg::Data(Payload::Reduced(r)) if r.len() == values.len() => {
                                values.copy_from_slice(r);
                            }
                            msg => return Err(unexpected("reduced", &msg)),
                        }
                    }
                }

                Ok(())
            })
            .map_err(dist_err)
    }

    /// Concatenates `local` across every rank, in rank order.
    pub fn all_gather(&mut self, local: &[f32]) -> Result<Vec<f32>> {
        let Some(Group {
            runtime,
            link,
            rx_buf,
        }) = &mut self.group
        else {
            return Ok(local.to_vec());
        };

        runtime
            .block_on(async {
                match link {
                    Link::Hub(peers) => {
                        let mut gathered = local.to_vec();
                        for (rx, _) in peers.iter_mut() {
                            match rx.recv_into(rx_buf).await? {
                                Msg::Data(Payload::Shard(s)) => gathered.extend_from_slice(s),
                                msg => return Err(unexpected("shard", &msg)),
                            }
                        }

                        let msg = Msg::Data(Payload::Gathered(&gathered));
                        for (_, tx) in peers.iter_mut() {
                            tx.send(&msg).await?;
                        }
                        Ok(gathered)
                    }
                    Link::Peer(rx, tx) => {
                        tx.send(&Msg::Data(Payload::Shard(local))).await?;

                        match rx.recv_into(rx_buf).await? {
                            Msg::Data(Payload::Gathered(g)) => Ok(g.to_vec()),
                            msg => Err(unexpected("gathered", &msg)),
                        }
                    }
                }
            })
            .map_err(dist_err)
    }

    /// Tells the other side of every channel this process is leaving.
    ///
    /// Peers may already be gone when the group winds down, so failures are
    /// only logged.
    pub fn shutdown(mut self) {
        let Some(Group { runtime, link, .. }) = self.group.take() else {
            return;
        };

        let txs: Vec<NetTx> = match link {
            Link::Hub(peers) => peers.into_iter().map(|(_, tx)| tx).collect(),
            Link::Peer(_, tx) => vec![tx],
        };

        runtime.block_on(async move {
            let msg = Msg::Control(Command::Disconnect);
            for mut tx in txs {
                if let Err(e) = tx.send(&msg).await {
                    debug!("could not send disconnect: {e}");
                    continue;
                }
                if let Err(e) = tx.shutdown().await {
                    debug!("could not shut the channel down: {e}");
                }
            }
        });
    }
}

fn unexpected(expected: &str, msg: &Msg) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("expected a {expected} frame, got {}", msg.kind()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_process_collectives_are_identities() {
        let mut ctx = DistContext::single();
        let mut values = vec![1.0, 2.0];

        ctx.all_reduce_mean(&mut values).unwrap();
        assert_eq!(values, vec![1.0, 2.0]);
        assert_eq!(ctx.all_gather(&values).unwrap(), values);
        assert!(ctx.is_main_process());
        assert!(!ctx.is_distributed());
        ctx.shutdown();
    }

    #[test]
    fn hub_addresses() {
        assert_eq!(
            DistContext::hub_addr("tcp://10.0.0.1:29500").unwrap(),
            "10.0.0.1:29500"
        );
        assert!(DistContext::hub_addr("file:///tmp/rendezvous").is_err());
    }
}
