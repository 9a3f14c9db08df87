//! 타이머 서비스
//!
//! 마감 시각 오름차순 작업 목록 + 대기 루프 하나.
//! 핸들러는 내부 락을 놓은 상태에서 실행되므로 핸들러 안에서 register/cancel 가능.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// 대기할 작업이 없을 때 재확인 주기
const IDLE_WAIT: Duration = Duration::from_secs(10);

type Task = Box<dyn FnOnce() + Send + 'static>;

/// 등록된 타이머 식별자
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// 프로토콜 타이머 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// NACK 백오프 / 제3자 응답
    Recovery,
    /// SR / RR-Selection / RR 송신과 참여자 정리
    Report,
}

/// 프로토콜 코어가 타이머를 요청하는 창구
///
/// 같은 종류는 가장 이른 마감 하나만 유지하면 된다.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, kind: TimerKind, at: Instant);
}

struct Entry {
    id: u64,
    deadline: Instant,
    task: Task,
}

struct Inner {
    tasks: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    notify: Notify,
    running: AtomicBool,
}

/// 단일 대기 루프 타이머
#[derive(Clone)]
pub struct TimerService {
    inner: Arc<Inner>,
}

impl TimerService {
    /// 타이머 루프 시작 (tokio 런타임 안에서 호출)
    pub fn start() -> Self {
        let inner = Arc::new(Inner {
            tasks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            notify: Notify::new(),
            running: AtomicBool::new(true),
        });

        let runner = inner.clone();
        tokio::spawn(async move {
            run(runner).await;
        });

        Self { inner }
    }

    /// `delay` 후 `task` 실행 예약
    pub fn register<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;

        {
            let mut tasks = self.inner.tasks.lock();
            // 같은 마감 시각이면 먼저 등록된 작업이 먼저
            let pos = tasks.partition_point(|e| e.deadline <= deadline);
            tasks.insert(
                pos,
                Entry {
                    id,
                    deadline,
                    task: Box::new(task),
                },
            );
        }

        trace!("타이머 등록 #{} ({:?})", id, delay);
        self.inner.notify.notify_one();
        TimerHandle(id)
    }

    /// 대기 중이면 제거. 이미 실행됐거나 실행 중이면 false.
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        let mut tasks = self.inner.tasks.lock();
        match tasks.iter().position(|e| e.id == handle.0) {
            Some(i) => {
                tasks.remove(i);
                true
            }
            None => false,
        }
    }

    /// 대기 중인 작업 수
    pub fn pending(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// 루프 종료 (대기 작업은 버림)
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.tasks.lock().clear();
        self.inner.notify.notify_one();
    }
}

async fn run(inner: Arc<Inner>) {
    while inner.running.load(Ordering::SeqCst) {
        let wait = inner
            .tasks
            .lock()
            .first()
            .map(|e| e.deadline)
            .unwrap_or_else(|| Instant::now() + IDLE_WAIT);

        tokio::select! {
            _ = inner.notify.notified() => {}
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wait)) => {}
        }

        // 한 번에 최대 하나만 실행 후 재평가
        let due = {
            let mut tasks = inner.tasks.lock();
            match tasks.first() {
                Some(e) if e.deadline <= Instant::now() => Some(tasks.remove(0)),
                _ => None,
            }
        };

        if let Some(entry) = due {
            (entry.task)();
        }
    }

    debug!("타이머 루프 종료");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fires_in_deadline_order() {
        let timer = TimerService::start();
        let fired = Arc::new(Mutex::new(Vec::new()));

        for ms in [30u64, 10, 20] {
            let fired = fired.clone();
            timer.register(Duration::from_millis(ms), move || fired.lock().push(ms));
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*fired.lock(), vec![10, 20, 30]);
        assert_eq!(timer.pending(), 0);
        timer.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_pending_only() {
        let timer = TimerService::start();
        let fired = Arc::new(AtomicBool::new(false));

        let f = fired.clone();
        let handle = timer.register(Duration::from_millis(20), move || {
            f.store(true, Ordering::SeqCst);
        });
        assert!(timer.cancel(&handle));
        assert!(!timer.cancel(&handle));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!fired.load(Ordering::SeqCst));
        timer.shutdown();
    }

    #[tokio::test]
    async fn test_register_from_handler() {
        let timer = TimerService::start();
        let count = Arc::new(AtomicU64::new(0));

        let t = timer.clone();
        let c = count.clone();
        timer.register(Duration::from_millis(5), move || {
            c.fetch_add(1, Ordering::SeqCst);
            let c2 = c.clone();
            t.register(Duration::from_millis(5), move || {
                c2.fetch_add(1, Ordering::SeqCst);
            });
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        timer.shutdown();
    }
}
