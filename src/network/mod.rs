pub mod node;
pub mod overlay;
pub mod peers;

pub use node::*;
pub use overlay::*;
pub use peers::*;

/*
    The overlay is static and always reachable: the set of nodes and their links
    is fixed for the lifetime of a run, and a share handed to a partner during a
    round is delivered before that round's commit phase. There is no loss, no
    reordering across the round barrier and no membership churn.

    Each round a node asks the overlay for at most one partner. An overlay may
    answer "nobody" (an isolated node, or a node whose links are all gone); the
    protocol tolerates that and applies the configured no-partner policy.
*/
