use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use ripple_core::{DeadLetter, Producer};
use tracing::{debug, error, warn};

use crate::{Error, KafkaConfig, Result};

/// Fire-and-forget producer for dead-letter dispatch. Delivery failures are logged.
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    pub fn connect(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = config
            .client_config(&[
                ("message.timeout.ms", "5000"),
                ("client.id", "ripple-dead-letter"),
            ])
            .create()
            .map_err(|e| Error::Connection {
                server: config.server(),
                error: e.to_string(),
            })?;
        Ok(KafkaProducer { producer })
    }
}

impl Producer for KafkaProducer {
    fn produce(&self, record: DeadLetter) -> ripple_core::Result<()> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value),
            });
        }
        let mut future_record: FutureRecord<'_, String, [u8]> = FutureRecord::to(&record.topic)
            .headers(headers)
            .payload(record.payload.as_ref());
        if let Some(key) = record.key.as_ref() {
            future_record = future_record.key(key);
        }

        let delivery = self.producer.send_result(future_record).map_err(|(e, _)| {
            ripple_core::Error::Producer(format!("enqueueing dead letter for {}: {e}", record.topic))
        })?;

        let topic = record.topic.clone();
        tokio::spawn(async move {
            match delivery.await {
                Ok(Ok(_)) => debug!(%topic, "Dead letter delivered"),
                Ok(Err((e, _))) => error!(%topic, error = ?e, "Dead letter delivery failed"),
                Err(_) => warn!(%topic, "Dead letter delivery cancelled"),
            }
        });
        Ok(())
    }
}
