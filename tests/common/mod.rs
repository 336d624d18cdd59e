// SPDX-License-Identifier: LGPL-2.1-or-later
//
// This file is part of redqueue.
//
// redqueue is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// redqueue is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with redqueue. If not, see <https://www.gnu.org/licenses/>.

//! Shared test doubles: recording consumers with controllable pacing.

#![allow(dead_code)]

use async_trait::async_trait;
use redqueue::{BatchConsumer, Consumer, Delivery};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Consumer that records every delivery it receives.
///
/// With `auto_ack` it acks on receipt. With `auto_finish` disabled the
/// callback blocks after recording until [`TestConsumer::finish`] is called,
/// which holds exactly one delivery in-callback at a time and makes pipeline
/// arithmetic deterministic.
#[derive(Clone)]
pub struct TestConsumer {
    auto_ack: bool,
    auto_finish: bool,
    deliveries: Arc<Mutex<Vec<Delivery>>>,
    proceed: Arc<Semaphore>,
}

impl TestConsumer {
    pub fn new(auto_ack: bool, auto_finish: bool) -> Self {
        Self {
            auto_ack,
            auto_finish,
            deliveries: Arc::new(Mutex::new(Vec::new())),
            proceed: Arc::new(Semaphore::new(0)),
        }
    }

    /// All deliveries received so far, in order.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    /// The most recent delivery, if any.
    pub fn last_delivery(&self) -> Option<Delivery> {
        self.deliveries.lock().unwrap().last().cloned()
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    /// Let a blocked callback return and accept the next delivery.
    pub fn finish(&self) {
        self.proceed.add_permits(1);
    }
}

#[async_trait]
impl Consumer for TestConsumer {
    async fn consume(&self, delivery: Delivery) {
        self.deliveries.lock().unwrap().push(delivery.clone());
        if self.auto_ack {
            delivery.ack().await.unwrap();
        }
        if !self.auto_finish {
            let permit = self.proceed.acquire().await.unwrap();
            permit.forget();
        }
    }
}

/// Batch consumer that records the last batch and the running total.
#[derive(Clone)]
pub struct TestBatchConsumer {
    auto_finish: bool,
    last_batch: Arc<Mutex<Vec<Delivery>>>,
    consumed_count: Arc<Mutex<usize>>,
    proceed: Arc<Semaphore>,
}

impl TestBatchConsumer {
    pub fn new(auto_finish: bool) -> Self {
        Self {
            auto_finish,
            last_batch: Arc::new(Mutex::new(Vec::new())),
            consumed_count: Arc::new(Mutex::new(0)),
            proceed: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn last_batch(&self) -> Vec<Delivery> {
        self.last_batch.lock().unwrap().clone()
    }

    pub fn consumed_count(&self) -> usize {
        *self.consumed_count.lock().unwrap()
    }

    /// Clear the recorded batch and let a blocked callback return.
    pub fn finish(&self) {
        self.last_batch.lock().unwrap().clear();
        self.proceed.add_permits(1);
    }
}

#[async_trait]
impl BatchConsumer for TestBatchConsumer {
    async fn consume(&self, batch: Vec<Delivery>) {
        *self.consumed_count.lock().unwrap() += batch.len();
        *self.last_batch.lock().unwrap() = batch;
        if !self.auto_finish {
            let permit = self.proceed.acquire().await.unwrap();
            permit.forget();
        }
    }
}

/// Payloads of a list of deliveries, for compact assertions.
pub fn payloads(deliveries: &[Delivery]) -> Vec<Vec<u8>> {
    deliveries.iter().map(|d| d.payload().to_vec()).collect()
}
