// This file is part of tpsview, a playback engine for TPS DVR recordings.
// Copyright (C) 2025 The tpsview Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The WebSocket relay: the engine's single transport boundary.
//!
//! One socket carries everything: JSON text frames for control and status,
//! binary frames for media. A `play` or `seek` cancels the active stream
//! and starts a fresh engine; `pause` just cancels. The engine itself is
//! synchronous, so each stream runs on a blocking task and hands framed
//! bytes back through a bounded channel; backpressure from a slow client
//! stalls the engine rather than buffering unboundedly.

use std::sync::Arc;

use base::{Error, ErrorKind, ResultExt};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tracing::{debug, info, warn, Instrument};
use tps::{h265, wire, CancelHandle, Storage, StreamEvent};

use crate::json;

type WebSocket = tokio_tungstenite::WebSocketStream<TcpStream>;

/// Accepts WebSocket connections forever.
pub async fn serve(listener: TcpListener, storage: Arc<Storage>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, "accept failed");
                continue;
            }
        };
        let storage = storage.clone();
        let span = tracing::info_span!("conn", %peer);
        tokio::spawn(
            async move {
                info!("connected");
                match handle_conn(stream, storage).await {
                    Ok(()) => info!("closing"),
                    Err(err) => debug!(err = %err.chain(), "closing with error"),
                }
            }
            .instrument(span),
        );
    }
}

/// What a frame or control handler asks the connection loop to do next.
enum Action {
    Continue,
    Close,
    Start(json::PlayRequest),
    Stop,
    StreamDone,
}

/// Either a framed media message or a status update, produced by the pump.
enum WireMsg {
    Media(Vec<u8>),
    Status(json::Status),
}

struct ActiveStream {
    cancel: CancelHandle,
    rx: mpsc::Receiver<WireMsg>,
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn handle_conn(stream: TcpStream, storage: Arc<Storage>) -> Result<(), Error> {
    let mut ws = tokio_tungstenite::accept_async(stream)
        .await
        .err_kind(ErrorKind::Internal)?;
    let mut active: Option<ActiveStream> = None;
    loop {
        let action = match active.as_mut() {
            Some(a) => {
                tokio::select! {
                    msg = ws.next() => on_message(msg, &storage, &mut ws).await?,
                    frame = a.rx.recv() => on_frame(frame, &mut ws).await?,
                }
            }
            None => {
                let msg = ws.next().await;
                on_message(msg, &storage, &mut ws).await?
            }
        };
        match action {
            Action::Continue => {}
            Action::Close => break,
            Action::Start(req) => {
                // Dropping the previous stream cancels it; buffers are never
                // reused across seeks.
                active = Some(start_stream(storage.clone(), req));
            }
            Action::Stop => {
                active = None;
            }
            Action::StreamDone => {
                active = None;
            }
        }
    }
    Ok(())
}

async fn on_message(
    msg: Option<Result<tungstenite::Message, tungstenite::Error>>,
    storage: &Storage,
    ws: &mut WebSocket,
) -> Result<Action, Error> {
    let msg = match msg {
        None => return Ok(Action::Close),
        Some(Err(err)) => {
            debug!(%err, "websocket receive error");
            return Ok(Action::Close);
        }
        Some(Ok(m)) => m,
    };
    let text = match msg {
        tungstenite::Message::Text(text) => text,
        tungstenite::Message::Close(_) => return Ok(Action::Close),
        _ => return Ok(Action::Continue),
    };
    let req = match serde_json::from_str::<json::ControlRequest>(text.as_str()) {
        Ok(req) => req,
        Err(err) => {
            send_status(
                ws,
                &json::Status::Error {
                    message: format!("invalid control message: {err}"),
                },
            )
            .await?;
            return Ok(Action::Continue);
        }
    };
    debug!(?req, "control message");
    match req {
        json::ControlRequest::Play(req) | json::ControlRequest::Seek(req) => Ok(Action::Start(req)),
        json::ControlRequest::Pause => Ok(Action::Stop),
        json::ControlRequest::Dates { channel, time_zone } => {
            let status = match storage.list_dates(channel, zone(&time_zone)) {
                Ok(dates) => json::Status::Dates {
                    dates,
                    channels: storage.channels(),
                },
                Err(err) => error_status(err),
            };
            send_status(ws, &status).await?;
            Ok(Action::Continue)
        }
        json::ControlRequest::Recordings {
            date,
            channel,
            time_zone,
        } => {
            let status = match storage.list_recordings(&date, channel, zone(&time_zone)) {
                Ok(recordings) => json::Status::Recordings { recordings },
                Err(err) => error_status(err),
            };
            send_status(ws, &status).await?;
            Ok(Action::Continue)
        }
        json::ControlRequest::Status => {
            send_status(ws, &json::Status::CacheStatus(storage.cache_status())).await?;
            Ok(Action::Continue)
        }
    }
}

async fn on_frame(frame: Option<WireMsg>, ws: &mut WebSocket) -> Result<Action, Error> {
    let msg = match frame {
        None => return Ok(Action::StreamDone),
        Some(WireMsg::Media(bytes)) => tungstenite::Message::Binary(bytes.into()),
        Some(WireMsg::Status(status)) => status_message(&status)?,
    };
    if ws.send(msg).await.is_err() {
        return Ok(Action::Close);
    }
    Ok(Action::Continue)
}

fn zone(tz: &Option<String>) -> &str {
    tz.as_deref().unwrap_or("UTC")
}

fn error_status(err: Error) -> json::Status {
    json::Status::Error {
        message: err.to_string(),
    }
}

fn status_message(status: &json::Status) -> Result<tungstenite::Message, Error> {
    let text = serde_json::to_string(status).err_kind(ErrorKind::Internal)?;
    Ok(tungstenite::Message::Text(text.into()))
}

async fn send_status(ws: &mut WebSocket, status: &json::Status) -> Result<(), Error> {
    let _ = ws.send(status_message(status)?).await;
    Ok(())
}

fn start_stream(storage: Arc<Storage>, req: json::PlayRequest) -> ActiveStream {
    let cancel = CancelHandle::new();
    let (tx, rx) = mpsc::channel(64);
    let pump_cancel = cancel.clone();
    let span = tracing::info_span!("stream", channel = req.channel, timestamp = req.timestamp);
    tokio::task::spawn_blocking(move || {
        let _enter = span.enter();
        pump(&storage, &req, pump_cancel, &tx);
    });
    ActiveStream { cancel, rx }
}

/// Runs one stream engine to completion on a blocking thread, framing
/// every event for the wire. Stops early when the receiver goes away.
fn pump(storage: &Storage, req: &json::PlayRequest, cancel: CancelHandle, tx: &mpsc::Sender<WireMsg>) {
    let engine = match storage.open_stream(req.channel, req.timestamp, req.speed, cancel) {
        Ok(engine) => engine,
        Err(err) => {
            warn!(err = %err.chain(), "seek failed");
            let _ = tx.blocking_send(WireMsg::Status(error_status(err)));
            return;
        }
    };
    let seg = engine.segment();
    let start = WireMsg::Status(json::Status::StreamStart {
        channel: req.channel,
        start_time: seg.segment.start_time,
        end_time: seg.segment.end_time,
        actual_start_time: engine.start_ts_ms() / 1000,
        has_audio: !seg.audio.is_empty(),
        audio_format: "g711-ulaw",
        audio_sample_rate: wire::AUDIO_SAMPLE_RATE,
    });
    if tx.blocking_send(start).is_err() {
        return;
    }

    for event in engine {
        let res = match event {
            StreamEvent::VideoHeader {
                ts_ms,
                vps,
                sps,
                pps,
                idr,
            } => {
                if req.aggregate {
                    let frame =
                        wire::picture_frame(ts_ms, wire::KIND_IDR, &[&vps, &sps, &pps, &idr]);
                    tx.blocking_send(WireMsg::Media(frame))
                } else {
                    let mut res = Ok(());
                    for nal in [&vps, &sps, &pps, &idr] {
                        let frame = wire::video_frame(ts_ms, h265::nal_type(nal[0]), nal);
                        res = tx.blocking_send(WireMsg::Media(frame));
                        if res.is_err() {
                            break;
                        }
                    }
                    res
                }
            }
            StreamEvent::VideoNal { ts_ms, ty, data } => {
                tx.blocking_send(WireMsg::Media(wire::video_frame(ts_ms, ty, &data)))
            }
            StreamEvent::Audio { ts_ms, data } => {
                tx.blocking_send(WireMsg::Media(wire::audio_frame(ts_ms, &data)))
            }
            StreamEvent::End => {
                let _ = tx.blocking_send(WireMsg::Status(json::Status::StreamEnd));
                return;
            }
            StreamEvent::Error(err) => {
                warn!(err = %err.chain(), "stream failed");
                let _ = tx.blocking_send(WireMsg::Status(error_status(err)));
                return;
            }
        };
        if res.is_err() {
            // Receiver gone: the client disconnected or superseded this
            // stream.
            debug!("stream receiver dropped");
            return;
        }
    }
}
