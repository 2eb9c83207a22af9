use std::{
    collections::{BTreeMap, BTreeSet},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::{Mutex, MutexGuard, PoisonError},
};

use cidr::{IpCidr, IpInet};
use miette::Diagnostic;
use thiserror::Error;

/// Hands out single-host addresses from an overlay pool.
///
/// Every operation runs under one lock, so reading the cursor, comparing it against the end of
/// the pool and advancing it is a single step no matter how many threads share the allocator.
#[derive(Debug)]
pub struct Allocator {
    /// The pool addresses are handed out from.
    pool: IpCidr,

    /// Offset of the last address in the pool, relative to the network address.
    last_offset: u128,

    /// Mutable allocation state.
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    /// Offset of the last address the cursor handed out. Starts on the network address.
    cursor: u128,

    /// Offsets currently held, whether issued by the cursor or claimed.
    occupied: BTreeSet<u128>,

    /// Offsets given back through [`Allocator::release`].
    released: BTreeSet<u128>,

    /// Held offsets, by owner.
    owners: BTreeMap<String, u128>,
}

impl Allocator {
    /// Create an allocator over a pool. Nothing is issued yet.
    pub fn new(pool: IpCidr) -> Self {
        let host_bits = u32::from(pool.family().len() - pool.network_length());

        Self {
            pool,
            last_offset: 1u128
                .checked_shl(host_bits)
                .map_or(u128::MAX, |size| size - 1),
            state: Mutex::new(State::default()),
        }
    }

    /// The pool this allocator hands out addresses from.
    pub fn pool(&self) -> IpCidr {
        self.pool
    }

    /// Take the next unused address after the cursor.
    ///
    /// Never returns the network address and never wraps: once the cursor has passed the last
    /// address of the pool, every call fails with [`AllocatorError::Exhausted`].
    pub fn next(&self) -> Result<IpInet, AllocatorError> {
        let mut state = self.lock();
        let offset = self.advance(&mut state)?;

        Ok(self.host(offset))
    }

    /// Get the address held by `owner`, taking a new one if it holds none.
    ///
    /// Released addresses are reused before the cursor moves.
    pub fn assign(&self, owner: &str) -> Result<IpInet, AllocatorError> {
        let mut state = self.lock();

        if let Some(&offset) = state.owners.get(owner) {
            return Ok(self.host(offset));
        }

        let offset = match state.released.pop_first() {
            Some(offset) => {
                state.occupied.insert(offset);
                offset
            }
            None => self.advance(&mut state)?,
        };
        state.owners.insert(owner.to_owned(), offset);

        log::trace!(
            "assigned {} to `{owner}` from {}",
            self.host(offset),
            self.pool
        );

        Ok(self.host(offset))
    }

    /// Record that `owner` already holds `address`, so it is never handed to anyone else.
    ///
    /// Addresses outside the pool are not tracked and are accepted as-is.
    /// If `owner` held a different address, that one is released.
    pub fn claim(&self, owner: &str, address: IpAddr) -> Result<(), AllocatorError> {
        if !self.pool.contains(&address) {
            return Ok(());
        }

        let offset = bits(address) - bits(self.pool.first_address());
        if offset == 0 {
            return Err(AllocatorError::Reserved { address });
        }

        let mut state = self.lock();

        if let Some((holder, _)) = state
            .owners
            .iter()
            .find(|&(holder, &held)| held == offset && holder != owner)
        {
            return Err(AllocatorError::Conflict {
                address,
                owner: holder.clone(),
            });
        }

        if let Some(previous) = state.owners.insert(owner.to_owned(), offset) {
            if previous != offset {
                state.occupied.remove(&previous);
                state.released.insert(previous);
            }
        }
        state.released.remove(&offset);
        state.occupied.insert(offset);

        Ok(())
    }

    /// Give back the address held by `owner`, if any, and return it.
    pub fn release(&self, owner: &str) -> Option<IpInet> {
        let mut state = self.lock();

        let offset = state.owners.remove(owner)?;
        state.occupied.remove(&offset);
        state.released.insert(offset);

        Some(self.host(offset))
    }

    /// The address currently held by `owner`.
    pub fn holding(&self, owner: &str) -> Option<IpInet> {
        self.lock()
            .owners
            .get(owner)
            .map(|&offset| self.host(offset))
    }

    /// Move the cursor to the next unoccupied offset, marking it occupied.
    fn advance(&self, state: &mut State) -> Result<u128, AllocatorError> {
        loop {
            if state.cursor >= self.last_offset {
                return Err(AllocatorError::Exhausted { pool: self.pool });
            }

            state.cursor += 1;
            if state.occupied.insert(state.cursor) {
                return Ok(state.cursor);
            }
        }
    }

    /// The single-host address at an offset into the pool.
    fn host(&self, offset: u128) -> IpInet {
        let base = bits(self.pool.first_address());

        IpInet::new_host(match self.pool {
            IpCidr::V4(_) => IpAddr::V4(Ipv4Addr::from((base + offset) as u32)),
            IpCidr::V6(_) => IpAddr::V6(Ipv6Addr::from(base + offset)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // The state is only mutated after every check has passed, so it is consistent even if a
        // holder of the lock panicked.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn bits(address: IpAddr) -> u128 {
    match address {
        IpAddr::V4(address) => u128::from(u32::from(address)),
        IpAddr::V6(address) => u128::from(address),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum AllocatorError {
    #[error("address pool {pool} is exhausted")]
    #[diagnostic(
        code(meshwork::allocator::exhausted),
        help("widen the overlay pool or remove nodes that are gone")
    )]
    Exhausted { pool: IpCidr },

    #[error("address {address} is already held by `{owner}`")]
    #[diagnostic(code(meshwork::allocator::conflict))]
    Conflict { address: IpAddr, owner: String },

    #[error("address {address} is the network address of the pool")]
    #[diagnostic(code(meshwork::allocator::reserved))]
    Reserved { address: IpAddr },
}
