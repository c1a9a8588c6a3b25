//! Scoped transactional unit of work.

use std::ops::{Deref, DerefMut};

use tracing::warn;

use super::{Session, Storage, StoreError};

/// A session that is rolled back unless it is explicitly committed.
///
/// Dropping the guard (early return, `?`, or a panic unwinding through it) rolls
/// the session back.
pub struct UnitOfWork<S: Session> {
    session: S,
    finished: bool,
}

impl<S: Session> UnitOfWork<S> {
    /// Open a new session on `storage`.
    pub fn begin<St>(storage: &St) -> Result<Self, StoreError>
    where
        St: Storage<Session = S> + ?Sized,
    {
        Ok(Self {
            session: storage.begin()?,
            finished: false,
        })
    }

    pub fn commit(mut self) -> Result<(), StoreError> {
        self.finished = true;
        self.session.commit()
    }

    pub fn rollback(mut self) -> Result<(), StoreError> {
        self.finished = true;
        self.session.rollback()
    }
}

impl<S: Session> Deref for UnitOfWork<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S: Session> DerefMut for UnitOfWork<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

impl<S: Session> Drop for UnitOfWork<S> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.session.rollback() {
            warn!(error = %err, "rollback of abandoned unit of work failed");
        }
    }
}

/// Run `f` inside a unit of work: commit when it returns `Ok`, roll back otherwise.
pub fn with_unit_of_work<St, T, E, F>(storage: &St, f: F) -> Result<T, E>
where
    St: Storage + ?Sized,
    E: From<StoreError>,
    F: FnOnce(&mut St::Session) -> Result<T, E>,
{
    let mut uow = UnitOfWork::begin(storage)?;
    match f(&mut uow) {
        Ok(value) => {
            uow.commit()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = uow.rollback() {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}
