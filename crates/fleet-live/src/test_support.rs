use crate::transport::{Connection, ConnectionId, Connector, ReadyState};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use url::Url;

pub(crate) struct MockConnection {
    endpoint: Url,
    state: Cell<ReadyState>,
    close_calls: Cell<u32>,
}

impl MockConnection {
    pub(crate) fn set_open(&self) {
        self.state.set(ReadyState::Open);
    }

    pub(crate) fn set_closed(&self) {
        self.state.set(ReadyState::Closed);
    }

    pub(crate) fn close_calls(&self) -> u32 {
        self.close_calls.get()
    }

    pub(crate) fn endpoint(&self) -> Url {
        self.endpoint.clone()
    }
}

impl Connection for Rc<MockConnection> {
    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    fn close(&self) {
        self.close_calls.set(self.close_calls.get() + 1);
        self.state.set(ReadyState::Closed);
    }
}

#[derive(Default)]
pub(crate) struct MockConnector {
    connections: RefCell<Vec<(ConnectionId, Rc<MockConnection>)>>,
}

impl MockConnector {
    pub(crate) fn opened(&self) -> usize {
        self.connections.borrow().len()
    }

    pub(crate) fn live(&self) -> usize {
        self.connections
            .borrow()
            .iter()
            .filter(|(_, connection)| connection.state.get() != ReadyState::Closed)
            .count()
    }

    pub(crate) fn last(&self) -> Rc<MockConnection> {
        self.connections
            .borrow()
            .last()
            .map(|(_, connection)| connection.clone())
            .expect("no connection opened")
    }
}

impl Connector for MockConnector {
    fn open(&self, id: ConnectionId, endpoint: &Url) -> Box<dyn Connection> {
        let connection = Rc::new(MockConnection {
            endpoint: endpoint.clone(),
            state: Cell::new(ReadyState::Connecting),
            close_calls: Cell::new(0),
        });
        self.connections.borrow_mut().push((id, connection.clone()));
        Box::new(connection)
    }
}
