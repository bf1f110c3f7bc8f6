/*! DoCAN — transport protocol for diagnostic communication over CAN
(ISO 15765-2).

The protocol turns a sequence of bounded CAN frames (classic 8 byte, or
CAN FD up to 64 byte) into transport messages of arbitrary length and
vice versa:

```text
 CAN frames  --> FrameCodec --> DoCanReceiver    --> transport listener
 upper send  --> DoCanTransmitter --> FrameCodec --> CAN frame transmitter
```

A message that fits a single frame is sent as a `SingleFrame`. Larger
messages start with a `FirstFrame` carrying the total length, after which
the receiver paces the sender with `FlowControl` frames (continue to
send / wait / overflow, block size, minimum separation time) and the
remaining payload follows in sequence numbered `ConsecutiveFrame`s.

The crate contains only the protocol core. CAN hardware access, frame
reception and the mapping of diagnostic addresses to CAN identifiers are
injected through the traits in [`datalink`] and [`addressing`]; message
buffers come from the layer above through the `docan-transport` traits.
All pools are fixed capacity, nothing allocates.

Concurrency model: each component is driven from one owning task context
(`process`, `cyclic_task`), while the CAN driver may deliver its
callbacks from a second context such as an interrupt handler. Shared
state is guarded by short critical sections; upper layer callbacks and
driver calls are always issued with the lock released.
*/

#![no_std]

#[cfg(test)]
extern crate std;

pub mod addressing;
pub mod datalink;
pub mod job;
pub mod parameters;
pub mod receiver;
mod timer;
pub mod transmitter;
