use std::marker::PhantomData;

/// A fire-and-forget channel carrying payloads of type `T`.
///
/// Ids share no namespace with request channels.
pub struct MessageChannel<T> {
    id: &'static str,
    _payload: PhantomData<fn() -> T>,
}

impl<T> MessageChannel<T> {
    pub const fn new(id: &'static str) -> Self {
        Self {
            id,
            _payload: PhantomData,
        }
    }

    pub const fn id(&self) -> &'static str {
        self.id
    }
}

impl<T> Clone for MessageChannel<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for MessageChannel<T> {}

impl<T> std::fmt::Debug for MessageChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MessageChannel").field(&self.id).finish()
    }
}

/// A request/response channel: arguments `A`, response `R`.
pub struct RequestChannel<A, R> {
    id: &'static str,
    _types: PhantomData<fn(A) -> R>,
}

impl<A, R> RequestChannel<A, R> {
    pub const fn new(id: &'static str) -> Self {
        Self {
            id,
            _types: PhantomData,
        }
    }

    pub const fn id(&self) -> &'static str {
        self.id
    }
}

impl<A, R> Clone for RequestChannel<A, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A, R> Copy for RequestChannel<A, R> {}

impl<A, R> std::fmt::Debug for RequestChannel<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RequestChannel").field(&self.id).finish()
    }
}
