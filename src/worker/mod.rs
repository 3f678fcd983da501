//! Worker-side bootstrap.
//!
//! A worker dials the master, presents `Hello`, accepts its job
//! descriptor, reports `Ready`, and on `Go` runs the named kernel. The
//! kernel outcome goes back as `Done` or `Fail{reason}`, after which the
//! worker waits for `Shutdown` and exits.

use std::time::Duration;

use tokio::net::TcpStream;
use uuid::Uuid;

use crate::cancel::CancelFlag;
use crate::comm::ClusterComm;
use crate::error::{FlotillaError, Result};
use crate::kernels;
use crate::protocol::frame::{read_frame, write_frame};
use crate::protocol::{Envelope, JobDescriptor, Message, Rank, MASTER_RANK};

/// How long a worker waits for the master's `Shutdown` after reporting
/// its result.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(60);

const DRAIN_GRACE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct BootstrapArgs {
    pub master_host: String,
    pub master_port: u16,
    pub rank: Rank,
    pub size: u32,
    pub job_id: Uuid,
    pub nonce: Uuid,
}

/// Run one worker end to end. The caller maps the error (if any) to a
/// process exit code.
pub async fn run_worker(args: BootstrapArgs) -> Result<()> {
    let (stream, descriptor) = dial_and_handshake(&args).await?;
    tracing::info!(
        rank = args.rank,
        job_id = %descriptor.job_id,
        kernel = descriptor.kernel.name(),
        "bootstrap complete"
    );

    let cancel = CancelFlag::new();
    let (comm, signals) =
        ClusterComm::worker(stream, args.rank, args.size, cancel.clone(), DRAIN_GRACE);

    let outcome = kernels::dispatch(&comm, &cancel, &descriptor.kernel).await;
    match &outcome {
        Ok(()) => {
            let _ = comm.send_control(MASTER_RANK, Message::Done(None)).await;
        }
        Err(e) => {
            let reason = match e {
                FlotillaError::Cancelled => "cancelled".to_string(),
                other => other.to_string(),
            };
            tracing::warn!(rank = args.rank, %reason, "kernel did not complete");
            let _ = comm
                .send_control(MASTER_RANK, Message::Fail { reason })
                .await;
        }
    }

    signals.wait_shutdown(SHUTDOWN_WAIT).await;
    comm.close(Duration::from_secs(2)).await;

    if let Some(fault) = signals.take_fault() {
        return Err(FlotillaError::ProtocolViolation(fault));
    }
    outcome
}

/// Dial the master and complete the handshake: `Hello` out, descriptor
/// in, `Ready` out, then block for `Go`.
pub async fn dial_and_handshake(args: &BootstrapArgs) -> Result<(TcpStream, JobDescriptor)> {
    let mut stream = TcpStream::connect((args.master_host.as_str(), args.master_port))
        .await
        .map_err(|e| {
            FlotillaError::HandshakeFailure(format!(
                "cannot reach master at {}:{}: {e}",
                args.master_host, args.master_port
            ))
        })?;

    write_frame(
        &mut stream,
        &Envelope {
            from: args.rank,
            to: MASTER_RANK,
            seq: 0,
            message: Message::Hello {
                job_id: args.job_id,
                nonce: args.nonce,
                claimed_rank: args.rank,
            },
        },
    )
    .await?;

    let envelope = read_frame(&mut stream).await.map_err(|e| match e {
        FlotillaError::Io(e) => {
            FlotillaError::HandshakeFailure(format!("master hung up during handshake: {e}"))
        }
        other => other,
    })?;
    let descriptor = match envelope.message {
        Message::JobDescriptor(descriptor) => descriptor,
        other => {
            return Err(FlotillaError::ProtocolViolation(format!(
                "expected JOB_DESCRIPTOR, got {}",
                other.kind()
            )))
        }
    };
    if descriptor.job_id != args.job_id
        || descriptor.rank != args.rank
        || descriptor.size != args.size
    {
        return Err(FlotillaError::HandshakeFailure(
            "job descriptor does not match bootstrap arguments".into(),
        ));
    }

    write_frame(
        &mut stream,
        &Envelope {
            from: args.rank,
            to: MASTER_RANK,
            seq: 1,
            message: Message::Ready,
        },
    )
    .await?;

    let envelope = read_frame(&mut stream).await?;
    match envelope.message {
        Message::Go => Ok((stream, descriptor)),
        // The master aborted the launch; nothing to run.
        Message::Shutdown => Err(FlotillaError::HandshakeFailure(
            "launch aborted by master".into(),
        )),
        other => Err(FlotillaError::ProtocolViolation(format!(
            "expected GO, got {}",
            other.kind()
        ))),
    }
}
