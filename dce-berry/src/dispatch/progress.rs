//! 单槽位, 最新值优先的进度通道.
//!
//! # 有损语义
//!
//! 通道容量为 1. 生产者 (工作线程) 发送时如果槽位已被占用, 会先丢弃旧值再写入新值;
//! 消费者每次轮询通过 [`ProgressReceiver::drain_latest`] 取走槽位中的值.
//! 因此两次轮询之间产生的多个进度中, 只有最新的一个能被观察到, 中间值会被静默丢弃.
//!
//! 每个工作线程是其通道的唯一生产者.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};

/// 一条进度消息.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Progress {
    /// 产生该进度的工作线程编号.
    pub worker_id: usize,

    /// 百分比, `0.0..=100.0`.
    pub percent: f64,
}

/// 创建一对进度通道端点.
pub fn progress_channel(worker_id: usize) -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = bounded(1);
    (
        ProgressSender {
            worker_id,
            tx,
            evict: rx.clone(),
        },
        ProgressReceiver { rx },
    )
}

/// 进度生产端. 发送永不阻塞.
#[derive(Debug)]
pub struct ProgressSender {
    worker_id: usize,
    tx: Sender<Progress>,
    // 仅用于在槽位已满时丢弃旧值.
    evict: Receiver<Progress>,
}

impl ProgressSender {
    /// 发送进度 `percent`. 槽位已满时替换旧值.
    ///
    /// 消费端已经关闭时静默忽略.
    pub fn send(&self, percent: f64) {
        let mut msg = Progress {
            worker_id: self.worker_id,
            percent,
        };
        loop {
            match self.tx.try_send(msg) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => return,
                Err(TrySendError::Full(back)) => {
                    msg = back;
                    // 与消费者竞争同一个旧值, 谁取走都可以.
                    let _ = self.evict.try_recv();
                }
            }
        }
    }

    /// 工作线程编号.
    #[inline]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }
}

/// 进度消费端.
#[derive(Debug)]
pub struct ProgressReceiver {
    rx: Receiver<Progress>,
}

impl ProgressReceiver {
    /// 非阻塞地取走通道中所有进度, 只返回最新的一个. 没有新进度时返回 `None`.
    pub fn drain_latest(&self) -> Option<Progress> {
        let mut latest = None;
        loop {
            match self.rx.try_recv() {
                Ok(p) => latest = Some(p),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return latest,
            }
        }
    }
}
