use std::sync::mpsc::{self, Receiver};
use std::sync::{Mutex, PoisonError};
use std::thread;

/// Run `work` over every job `produce` submits, on `workers` threads.
///
/// `produce` runs on its own thread and hands jobs to `submit`, which blocks
/// while every worker is busy and returns `false` once no worker is left.
/// Results are folded by `collect` on the calling thread, in completion
/// order. Returns whatever `produce` returns after all work has drained.
/// A panic in `work` stops the producer and is resumed on the caller.
pub(crate) fn fan_out<T, R, P>(
    workers: usize,
    produce: impl FnOnce(&mut dyn FnMut(T) -> bool) -> P + Send,
    work: impl Fn(T) -> R + Sync,
    mut collect: impl FnMut(R),
) -> P
where
    T: Send,
    R: Send,
    P: Send,
{
    let workers = workers.max(1);
    let (job_tx, job_rx) = mpsc::sync_channel::<T>(workers);
    let jobs = Mutex::new(Some(job_rx));
    let (result_tx, result_rx) = mpsc::channel::<R>();
    let jobs = &jobs;
    let work = &work;

    thread::scope(|scope| {
        for _ in 0..workers {
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                let _close = CloseOnPanic(jobs);
                loop {
                    let next = match lock(jobs).as_ref() {
                        Some(rx) => rx.recv(),
                        None => return,
                    };
                    let Ok(job) = next else {
                        return;
                    };
                    if result_tx.send(work(job)).is_err() {
                        return;
                    }
                }
            });
        }
        drop(result_tx);

        let producer = scope.spawn(move || {
            let mut submit = |job: T| job_tx.send(job).is_ok();
            produce(&mut submit)
        });

        for result in result_rx {
            collect(result);
        }

        match producer.join() {
            Ok(value) => value,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    })
}

type Jobs<T> = Mutex<Option<Receiver<T>>>;

fn lock<T>(jobs: &Jobs<T>) -> std::sync::MutexGuard<'_, Option<Receiver<T>>> {
    jobs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drops the shared receiver when a worker unwinds, so the producer's next
/// send fails instead of blocking on a full channel.
struct CloseOnPanic<'a, T>(&'a Jobs<T>);

impl<T> Drop for CloseOnPanic<'_, T> {
    fn drop(&mut self) {
        if thread::panicking() {
            lock(self.0).take();
        }
    }
}
