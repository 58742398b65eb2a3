//! AsyncDht node.

use crate::{
    common::{
        hash_immutable, FindNodeRequestArguments, GetValueRequestArguments, Id, MutableItem, Node,
        PutImmutableRequestArguments, PutMutableRequestArguments, PutRequestSpecific,
    },
    dht::{
        parse_key, ActorMessage, Dht, DhtGetError, DhtPutError, DhtWasShutdown, ResponseSender,
    },
    engine::{GetRequestSpecific, Info, PutError, QueryValue},
};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// Information about this [Dht] node.
    pub async fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.0.send(ActorMessage::Info(sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Turn this node's routing table to a list of bootstraping nodes.
    pub async fn to_bootstrap(&self) -> Result<Vec<String>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<String>>(1);

        self.0.send(ActorMessage::ToBootstrap(sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop.
    pub async fn shutdown(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv_async().await;
    }

    /// See [Dht::cancel].
    pub fn cancel(&self, target: Id) -> Result<(), DhtWasShutdown> {
        self.0.cancel(target)
    }

    /// Wait until the bootstraping query is done.
    ///
    /// Returns true if the bootstraping was successful.
    pub async fn bootstrapped(&self) -> Result<bool, DhtWasShutdown> {
        let info = self.info().await?;

        let nodes = self.find_node(*info.id()).await?;

        Ok(!nodes.is_empty())
    }

    // === Find nodes ===

    pub async fn find_node(&self, target: Id) -> Result<Box<[Node]>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Box<[Node]>>(1);

        let request = GetRequestSpecific::FindNode(FindNodeRequestArguments { target });

        self.0
            .send(ActorMessage::Get(request, ResponseSender::ClosestNodes(sender)))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    // === Immutable data ===

    /// Get an Immutable data by its sha1 hash.
    pub async fn get_immutable(&self, target: Id) -> Result<Option<Box<[u8]>>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Option<Box<[u8]>>>(1);

        let request = GetRequestSpecific::GetValue(GetValueRequestArguments {
            target,
            seq: None,
            salt: None,
        });

        self.0
            .send(ActorMessage::Get(request, ResponseSender::Immutable(sender)))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Put an immutable data to the DHT.
    pub async fn put_immutable(&self, value: &[u8]) -> Result<Id, DhtPutError> {
        let target: Id = hash_immutable(value).into();

        let request = PutRequestSpecific::PutImmutable(PutImmutableRequestArguments {
            target,
            v: value.into(),
        });

        self.put_request(request).await
    }

    // === Mutable data ===

    /// Get the most recent mutable item by its public_key and optional salt.
    pub async fn get_mutable(
        &self,
        public_key: &[u8; 32],
        salt: Option<&[u8]>,
        seq: Option<i64>,
    ) -> Result<Option<MutableItem>, DhtWasShutdown> {
        let target = MutableItem::target_from_key(public_key, salt);

        let (sender, receiver) = flume::bounded::<Option<MutableItem>>(1);

        let request = GetRequestSpecific::GetValue(GetValueRequestArguments {
            target,
            seq,
            salt: salt.map(|s| s.into()),
        });

        self.0
            .send(ActorMessage::Get(request, ResponseSender::Mutable(sender)))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Put a mutable item to the DHT.
    pub async fn put_mutable(
        &self,
        item: MutableItem,
        cas: Option<i64>,
    ) -> Result<Id, DhtPutError> {
        let request = PutRequestSpecific::PutMutable(PutMutableRequestArguments::from(item, cas));

        self.put_request(request).await
    }

    // === Records ===

    /// See [Dht::put].
    pub async fn put(&self, item: MutableItem) -> Result<String, DhtPutError> {
        self.put_mutable(item, None)
            .await
            .map(|target| target.to_string())
    }

    /// See [Dht::get].
    pub async fn get(&self, key: &str) -> Result<Box<[u8]>, DhtGetError> {
        let target = parse_key(key)?;

        let (sender, receiver) = flume::bounded::<Option<QueryValue>>(1);

        let request = GetRequestSpecific::GetValue(GetValueRequestArguments {
            target,
            seq: None,
            salt: None,
        });

        self.0
            .send(ActorMessage::Get(request, ResponseSender::Value(sender)))?;

        match receiver
            .recv_async()
            .await
            .map_err(|_| DhtWasShutdown)?
        {
            Some(QueryValue::Mutable(item)) => Ok(item.value().into()),
            Some(QueryValue::Immutable(v)) => Ok(v),
            None => Err(DhtGetError::NotFound),
        }
    }

    // === Private Methods ===

    async fn put_request(&self, request: PutRequestSpecific) -> Result<Id, DhtPutError> {
        let (sender, receiver) = flume::bounded::<Result<Id, PutError>>(1);

        self.0.send(ActorMessage::Put(request, sender))?;

        Ok(receiver
            .recv_async()
            .await
            .map_err(|_| DhtWasShutdown)??)
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use ed25519_dalek::SigningKey;

    use crate::dht::Testnet;

    use super::*;

    #[test]
    fn shutdown() {
        async fn test() {
            let dht = Dht::builder()
                .port(0)
                .bootstrap::<String>(&[])
                .build()
                .unwrap()
                .as_async();

            let a = dht.clone();

            dht.shutdown().await;

            let result = a.get_immutable(Id::random()).await;

            assert!(matches!(result, Err(DhtWasShutdown)))
        }
        futures::executor::block_on(test());
    }

    #[test]
    fn put_get_immutable() {
        async fn test() {
            let testnet = Testnet::new(10).unwrap();

            let a = Dht::builder()
                .port(0)
                .bootstrap(&testnet.bootstrap)
                .build()
                .unwrap()
                .as_async();
            let b = Dht::builder()
                .port(0)
                .bootstrap(&testnet.bootstrap)
                .build()
                .unwrap()
                .as_async();

            let value = b"Hello World!";
            let expected_target = Id::from_str("e5f96f6f38320f0f33959cb4d3d656452117aadb").unwrap();

            let target = a.put_immutable(value).await.unwrap();
            assert_eq!(target, expected_target);

            let response = b.get_immutable(target).await.unwrap();
            assert_eq!(response, Some(value.to_vec().into_boxed_slice()));
        }

        futures::executor::block_on(test());
    }

    #[test]
    fn put_get_mutable() {
        async fn test() {
            let testnet = Testnet::new(10).unwrap();

            let a = Dht::builder()
                .port(0)
                .bootstrap(&testnet.bootstrap)
                .build()
                .unwrap()
                .as_async();
            let b = Dht::builder()
                .port(0)
                .bootstrap(&testnet.bootstrap)
                .build()
                .unwrap()
                .as_async();

            let signer = SigningKey::from_bytes(&[
                56, 171, 62, 85, 105, 58, 155, 209, 189, 8, 59, 109, 137, 84, 84, 201, 221, 115,
                7, 228, 127, 70, 4, 204, 182, 64, 77, 98, 92, 215, 27, 103,
            ]);

            let item = MutableItem::new(&signer, b"Hello World!", 1000, Some(b"salt"));

            a.put_mutable(item.clone(), None).await.unwrap();

            let response = b
                .get_mutable(signer.verifying_key().as_bytes(), Some(b"salt"), None)
                .await
                .unwrap();

            assert_eq!(response, Some(item));
        }

        futures::executor::block_on(test());
    }

    #[test]
    fn put_and_get_record() {
        async fn test() {
            let testnet = Testnet::new(5).unwrap();

            let a = Dht::builder()
                .port(0)
                .bootstrap(&testnet.bootstrap)
                .build()
                .unwrap()
                .as_async();

            let signer = SigningKey::from_bytes(&[7; 32]);
            let item = Dht::create_put_request(&signer, b"did document", 3).unwrap();

            let target = a.put(item).await.unwrap();

            assert_eq!(&*a.get(&target).await.unwrap(), b"did document");
        }

        futures::executor::block_on(test());
    }
}
