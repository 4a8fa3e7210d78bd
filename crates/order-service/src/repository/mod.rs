//! 订单存储层

mod memory;
mod order_repo;
mod traits;

pub use memory::InMemoryOrderRepository;
pub use order_repo::OrderRepository;
pub use traits::OrderRepositoryTrait;

#[cfg(test)]
pub use traits::MockOrderRepositoryTrait;
