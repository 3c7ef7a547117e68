// src/detection/scan_worker.rs
use log::{debug, info, warn};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};

use crate::detection::heuristics::{RgbFrame, ScanProfile, WindowHit, cluster_hits, scan_windows};
use crate::errors::VeilpixError;

#[derive(Debug)]
pub struct ScanRequest {
    pub frame: RgbFrame,
    pub profile: ScanProfile,
}

#[derive(Debug)]
pub struct ScanResponse {
    pub windows_scored: usize,
    pub clusters: Vec<WindowHit>,
}

enum ScanMessage {
    Job {
        request: ScanRequest,
        reply: oneshot::Sender<ScanResponse>,
    },
    Stop,
}

/// Cloneable sender side of the scan worker.
#[derive(Clone)]
pub struct ScanWorkerHandle {
    sender: mpsc::Sender<ScanMessage>,
}

impl ScanWorkerHandle {
    pub async fn scan(&self, request: ScanRequest) -> Result<ScanResponse, VeilpixError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(ScanMessage::Job { request, reply })
            .await
            .map_err(|_| VeilpixError::ImageProcessing("scan worker has stopped".to_string()))?;
        response
            .await
            .map_err(|_| VeilpixError::ImageProcessing("scan worker dropped the request".to_string()))
    }
}

/// One dedicated thread that runs window scans. Frames move in, results move
/// out; nothing is shared with the caller.
pub struct ScanWorker {
    handle: ScanWorkerHandle,
    thread: JoinHandle<()>,
}

impl ScanWorker {
    pub fn spawn(queue_depth: usize) -> Result<Self, VeilpixError> {
        let (sender, mut receiver) = mpsc::channel::<ScanMessage>(queue_depth.max(1));
        let thread = thread::Builder::new()
            .name("veilpix-scan".to_string())
            .spawn(move || {
                while let Some(ScanMessage::Job { request, reply }) = receiver.blocking_recv() {
                    let hits = scan_windows(&request.frame, &request.profile);
                    let response = ScanResponse {
                        windows_scored: hits.len(),
                        clusters: cluster_hits(&hits),
                    };
                    debug!(
                        "Scan finished: {} hits, {} clusters",
                        response.windows_scored,
                        response.clusters.len()
                    );
                    // The requester may have given up; nothing to do then.
                    let _ = reply.send(response);
                }
                info!("Scan worker stopped");
            })
            .map_err(|e| VeilpixError::ImageProcessing(format!("cannot start scan worker: {}", e)))?;

        Ok(Self {
            handle: ScanWorkerHandle { sender },
            thread,
        })
    }

    pub fn handle(&self) -> ScanWorkerHandle {
        self.handle.clone()
    }

    /// Stops the worker after the scans already queued and waits for its
    /// thread. Handles still held elsewhere get an error from then on.
    pub async fn close(self) {
        info!("Closing scan worker");
        if self.handle.sender.send(ScanMessage::Stop).await.is_err() {
            debug!("Scan worker already stopped");
        }
        drop(self.handle);
        match tokio::task::spawn_blocking(move || self.thread.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!("Scan worker thread panicked"),
            Err(e) => warn!("Could not join scan worker: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::heuristics::fixtures::{draw_plate, scene};
    use crate::detection::heuristics::{Aggressiveness, PlateRules};

    #[tokio::test]
    async fn worker_answers_over_the_channel() {
        let worker = ScanWorker::spawn(4).unwrap();
        let mut img = scene(320, 200);
        draw_plate(&mut img, 100, 100);

        let response = worker
            .handle()
            .scan(ScanRequest {
                frame: RgbFrame::from_image(&img),
                profile: ScanProfile::Plate(PlateRules::for_level(Aggressiveness::Balanced)),
            })
            .await
            .unwrap();
        assert!(response.windows_scored > 0);
        assert_eq!(response.clusters.len(), 1);
    }

    #[tokio::test]
    async fn close_stops_the_thread_while_handles_remain() {
        let worker = ScanWorker::spawn(2).unwrap();
        let handle = worker.handle();
        worker.close().await;

        let err = handle
            .scan(ScanRequest {
                frame: RgbFrame::from_image(&scene(32, 32)),
                profile: ScanProfile::Plate(PlateRules::for_level(Aggressiveness::Simple)),
            })
            .await;
        assert!(err.is_err());
    }
}
