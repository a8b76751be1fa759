//! Pool acotado de workers asíncronos.
//!
//! Los trabajos entran por un canal compartido, cada worker saca el
//! siguiente en cuanto termina el anterior y los resultados vuelven por un
//! segundo canal. La barrera final espera a todos los workers del `JoinSet`.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::cancel::CancelSignal;

/// Resultados indexados por la posición del trabajo. Un hueco (`None`) solo
/// aparece si se canceló antes de terminar ese trabajo.
#[derive(Debug)]
pub struct PoolOutput<T> {
    pub results: Vec<Option<T>>,
    pub cancelled: bool,
}

pub async fn run_pool<J, T, F, Fut>(
    jobs: Vec<J>,
    workers: usize,
    cancel: &CancelSignal,
    work: F,
) -> PoolOutput<T>
where
    J: Send + 'static,
    T: Send + 'static,
    F: Fn(J) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let total = jobs.len();
    let mut results: Vec<Option<T>> = std::iter::repeat_with(|| None).take(total).collect();
    if total == 0 {
        return PoolOutput {
            results,
            cancelled: cancel.is_cancelled(),
        };
    }

    let (job_tx, job_rx) = mpsc::channel::<(usize, J)>(total);
    for (idx, job) in jobs.into_iter().enumerate() {
        // capacidad == total: nunca bloquea ni falla
        if job_tx.send((idx, job)).await.is_err() {
            break;
        }
    }
    drop(job_tx);

    let job_rx = Arc::new(Mutex::new(job_rx));
    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(usize, T)>();
    let work = Arc::new(work);
    let mut tasks = JoinSet::new();

    for worker_id in 0..workers.clamp(1, total) {
        let job_rx = Arc::clone(&job_rx);
        let result_tx = result_tx.clone();
        let work = Arc::clone(&work);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let next = job_rx.lock().await.recv().await;
                let Some((idx, job)) = next else {
                    break;
                };
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(worker_id, "Worker cancelado con trabajo en vuelo");
                        break;
                    }
                    output = work(job) => {
                        if result_tx.send((idx, output)).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
    drop(result_tx);

    while let Some((idx, output)) = result_rx.recv().await {
        results[idx] = Some(output);
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = ?e, "Tarea del pool terminó con pánico");
        }
    }

    let cancelled = cancel.is_cancelled() && results.iter().any(Option::is_none);
    PoolOutput { results, cancelled }
}
