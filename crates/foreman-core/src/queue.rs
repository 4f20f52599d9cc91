// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The per-app job queue.
//!
//! A bounded two-class priority queue: urgent drains before normal, FIFO
//! within each class. The queue owns pending jobs; dispatch transfers
//! ownership to the assigned slave.

use tokio::time::Instant;

use crate::job::{Job, JobId, JobMode};

/// Why the queue refused a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    QueueFull,
    DeadlineAlreadyPast,
}

/// Bounded two-class priority queue of pending jobs.
#[derive(Debug, Default)]
pub struct JobQueue {
    urgent: std::collections::VecDeque<Job>,
    normal: std::collections::VecDeque<Job>,
    /// 0 means unbounded.
    limit: usize,
    peak: usize,
}

impl JobQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    /// Admit one job. Urgent jobs go to the head of the urgent class,
    /// normal jobs to the tail of the normal class; pop order stays FIFO
    /// within each class.
    pub fn push(&mut self, job: Job, now: Instant) -> Result<(), (Job, RejectReason)> {
        if let Some(deadline) = job.deadline
            && deadline <= now
        {
            return Err((job, RejectReason::DeadlineAlreadyPast));
        }
        if self.limit != 0 && self.depth() >= self.limit {
            return Err((job, RejectReason::QueueFull));
        }

        match job.mode {
            JobMode::Urgent => self.urgent.push_front(job),
            JobMode::Normal => self.normal.push_back(job),
        }
        self.peak = self.peak.max(self.depth());
        Ok(())
    }

    /// Re-admit a job lost to a broken slave: it goes to the very front of
    /// the urgent class, ahead of jobs admitted before it. Bypasses the
    /// queue limit so the loss of a slave cannot also lose the job.
    pub fn requeue(&mut self, job: Job) {
        self.urgent.push_back(job);
        self.peak = self.peak.max(self.depth());
    }

    /// Take the next job: urgent before normal, FIFO within class.
    pub fn pop(&mut self) -> Option<Job> {
        self.urgent.pop_back().or_else(|| self.normal.pop_front())
    }

    /// Remove a pending job by id.
    pub fn cancel(&mut self, id: JobId) -> Option<Job> {
        if let Some(index) = self.urgent.iter().position(|job| job.id == id) {
            return self.urgent.remove(index);
        }
        if let Some(index) = self.normal.iter().position(|job| job.id == id) {
            return self.normal.remove(index);
        }
        None
    }

    /// Remove every job whose deadline has passed and return them for
    /// upstream notification.
    pub fn drop_expired(&mut self, now: Instant) -> Vec<Job> {
        let mut expired = Vec::new();
        for queue in [&mut self.urgent, &mut self.normal] {
            let mut index = 0;
            while index < queue.len() {
                let dead = queue[index].deadline.is_some_and(|deadline| deadline <= now);
                if dead {
                    expired.extend(queue.remove(index));
                } else {
                    index += 1;
                }
            }
        }
        expired
    }

    /// Take every pending job, leaving the queue empty. Used by drain.
    pub fn drain(&mut self) -> Vec<Job> {
        self.urgent.drain(..).chain(self.normal.drain(..)).collect()
    }

    /// Earliest deadline among pending jobs, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.urgent
            .iter()
            .chain(self.normal.iter())
            .filter_map(|job| job.deadline)
            .min()
    }

    pub fn depth(&self) -> usize {
        self.urgent.len() + self.normal.len()
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn is_empty(&self) -> bool {
        self.urgent.is_empty() && self.normal.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobHandle;
    use bytes::Bytes;
    use std::time::Duration;

    fn job(mode: JobMode) -> (Job, JobHandle) {
        Job::new("m", Bytes::new(), mode, None)
    }

    fn job_with_deadline(timeout: Duration) -> (Job, JobHandle) {
        Job::new("m", Bytes::new(), JobMode::Normal, Some(timeout))
    }

    #[tokio::test]
    async fn test_fifo_within_class() {
        let mut queue = JobQueue::new(0);
        let now = Instant::now();
        let (a, _ha) = job(JobMode::Normal);
        let (b, _hb) = job(JobMode::Normal);
        let (a_id, b_id) = (a.id, b.id);

        queue.push(a, now).unwrap();
        queue.push(b, now).unwrap();

        assert_eq!(queue.pop().unwrap().id, a_id);
        assert_eq!(queue.pop().unwrap().id, b_id);
    }

    #[tokio::test]
    async fn test_urgent_drains_first() {
        let mut queue = JobQueue::new(0);
        let now = Instant::now();
        let (normal, _hn) = job(JobMode::Normal);
        let (urgent_a, _ha) = job(JobMode::Urgent);
        let (urgent_b, _hb) = job(JobMode::Urgent);
        let ids = (normal.id, urgent_a.id, urgent_b.id);

        queue.push(normal, now).unwrap();
        queue.push(urgent_a, now).unwrap();
        queue.push(urgent_b, now).unwrap();

        // Urgent FIFO first, then normal.
        assert_eq!(queue.pop().unwrap().id, ids.1);
        assert_eq!(queue.pop().unwrap().id, ids.2);
        assert_eq!(queue.pop().unwrap().id, ids.0);
    }

    #[tokio::test]
    async fn test_requeue_jumps_urgent_line() {
        let mut queue = JobQueue::new(0);
        let now = Instant::now();
        let (urgent, _hu) = job(JobMode::Urgent);
        let (lost, _hl) = job(JobMode::Normal);
        let (urgent_id, lost_id) = (urgent.id, lost.id);

        queue.push(urgent, now).unwrap();
        queue.requeue(lost);

        assert_eq!(queue.pop().unwrap().id, lost_id);
        assert_eq!(queue.pop().unwrap().id, urgent_id);
    }

    #[tokio::test]
    async fn test_bounded_queue_rejects_overflow() {
        let mut queue = JobQueue::new(2);
        let now = Instant::now();
        let (a, _ha) = job(JobMode::Normal);
        let (b, _hb) = job(JobMode::Normal);
        let (c, _hc) = job(JobMode::Normal);

        queue.push(a, now).unwrap();
        queue.push(b, now).unwrap();
        let (_, reason) = queue.push(c, now).unwrap_err();
        assert_eq!(reason, RejectReason::QueueFull);
        assert_eq!(queue.depth(), 2);
    }

    #[tokio::test]
    async fn test_zero_limit_is_unbounded() {
        let mut queue = JobQueue::new(0);
        let now = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..1000 {
            let (j, h) = job(JobMode::Normal);
            handles.push(h);
            queue.push(j, now).unwrap();
        }
        assert_eq!(queue.depth(), 1000);
        assert_eq!(queue.peak(), 1000);
    }

    #[tokio::test]
    async fn test_past_deadline_rejected_at_admission() {
        let mut queue = JobQueue::new(0);
        let (j, _h) = job_with_deadline(Duration::from_millis(10));
        let later = Instant::now() + Duration::from_secs(1);

        let (_, reason) = queue.push(j, later).unwrap_err();
        assert_eq!(reason, RejectReason::DeadlineAlreadyPast);
    }

    #[tokio::test]
    async fn test_cancel_removes_from_either_class() {
        let mut queue = JobQueue::new(0);
        let now = Instant::now();
        let (urgent, _hu) = job(JobMode::Urgent);
        let (normal, _hn) = job(JobMode::Normal);
        let (urgent_id, normal_id) = (urgent.id, normal.id);

        queue.push(urgent, now).unwrap();
        queue.push(normal, now).unwrap();

        assert!(queue.cancel(normal_id).is_some());
        assert!(queue.cancel(normal_id).is_none());
        assert!(queue.cancel(urgent_id).is_some());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_drop_expired_keeps_live_jobs() {
        let mut queue = JobQueue::new(0);
        let now = Instant::now();
        let (expiring, _he) = job_with_deadline(Duration::from_millis(50));
        let (live, _hl) = job(JobMode::Normal);
        let (expiring_id, live_id) = (expiring.id, live.id);

        queue.push(expiring, now).unwrap();
        queue.push(live, now).unwrap();

        let expired = queue.drop_expired(now + Duration::from_millis(100));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, expiring_id);
        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.pop().unwrap().id, live_id);
    }

    #[tokio::test]
    async fn test_next_deadline_is_minimum() {
        let mut queue = JobQueue::new(0);
        let now = Instant::now();
        let (far, _hf) = job_with_deadline(Duration::from_secs(10));
        let (near, _hn) = job_with_deadline(Duration::from_secs(1));
        let near_deadline = near.deadline.unwrap();

        queue.push(far, now).unwrap();
        queue.push(near, now).unwrap();

        assert_eq!(queue.next_deadline(), Some(near_deadline));
    }

    #[tokio::test]
    async fn test_drain_empties_both_classes() {
        let mut queue = JobQueue::new(0);
        let now = Instant::now();
        let (a, _ha) = job(JobMode::Urgent);
        let (b, _hb) = job(JobMode::Normal);
        queue.push(a, now).unwrap();
        queue.push(b, now).unwrap();

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.peak(), 2);
    }
}
